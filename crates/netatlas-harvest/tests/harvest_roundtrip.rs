use netatlas_core::{ScoreType, SourceDescriptor, VariantConfig};
use netatlas_harvest::records_from_page;
use netatlas_store::RecordStore;
use tempfile::tempdir;

const SAY_PAGE: &str = r#"
    <html>
      <head><title>Tıp (SAY) Netler - YÖK Atlas</title></head>
      <body>
        <table id="mydata">
          <thead><tr>
            <th></th><th>Üniversite</th><th>Yılı</th><th>Türü</th><th>Katsayı</th>
            <th>Yerleşen Son Kişinin OBP</th><th>Yerleşen Son Kişi Yerleştiği Puan</th>
            <th>Yerleşen</th>
            <th>TYT Türkçe(40)</th><th>TYT Sosyal(20)</th><th>TYT Mat(40)</th><th>TYT Fen(20)</th>
            <th>AYT Mat(40)</th><th>AYT Fizik(14)</th><th>AYT Kimya(13)</th><th>AYT Biyoloji(13)</th>
          </tr></thead>
          <tbody>
            <tr>
              <td></td>
              <td><a href="lisans.php?y=104810377">Örnek Üniversitesi</a></td>
              <td>2024</td><td>Örgün</td><td>0.12</td>
              <td>455.1</td><td>512.33</td><td>103</td>
              <td>38.2</td><td>17.5</td><td>36.1</td><td>18.0</td>
              <td>37.4</td><td>12.1</td><td>11.3</td><td>12.0</td>
            </tr>
            <tr>
              <td></td>
              <td><a href="lisans.php?y=104810377">Örnek Üniversitesi</a></td>
              <td>2023</td><td>Örgün</td><td>0.12</td>
              <td>451.8</td><td>509.90</td><td>98</td>
              <td>37.9</td><td>16.8</td><td>35.4</td><td>17.2</td>
              <td>36.8</td><td>11.7</td><td>11.0</td><td>11.6</td>
            </tr>
          </tbody>
        </table>
      </body>
    </html>"#;

fn tip() -> SourceDescriptor {
    SourceDescriptor {
        name: "Tıp".to_string(),
        url: "https://example/netler-tablo.php?b=10204".to_string(),
    }
}

#[test]
fn say_page_extracts_and_persists_exactly_once() {
    let variants = VariantConfig::default();
    let (score_type, records) = records_from_page(SAY_PAGE, &tip(), &variants).unwrap();

    assert_eq!(score_type, ScoreType::Say);
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].identity, "Tıp|104810377|2024");
    assert_eq!(records[1].identity, "Tıp|104810377|2023");
    assert_eq!(records[0].field("placed_score"), Some("512.33"));
    assert_eq!(records[0].field("ayt_biology"), Some("12.0"));

    let dir = tempdir().unwrap();
    let mut store = RecordStore::new(dir.path(), variants.clone());

    let first = store.append(score_type, &records).unwrap();
    assert_eq!(first.written, 2);
    assert_eq!(first.skipped_duplicate, 0);

    // A second run over the same page must not duplicate any identity.
    let (score_type, records) = records_from_page(SAY_PAGE, &tip(), &variants).unwrap();
    let second = store.append(score_type, &records).unwrap();
    assert_eq!(second.written, 0);
    assert_eq!(second.skipped_duplicate, 2);

    let csv = std::fs::read_to_string(dir.path().join("say.csv")).unwrap();
    assert_eq!(csv.lines().count(), 3);
    assert!(csv.lines().next().unwrap().contains("AYT Biyoloji(13)"));
    assert!(dir.path().join("say.parquet").exists());
}

#[test]
fn interrupted_run_resumes_without_refetching_persisted_rows() {
    let variants = VariantConfig::default();
    let dir = tempdir().unwrap();

    {
        let mut store = RecordStore::new(dir.path(), variants.clone());
        let (score_type, records) = records_from_page(SAY_PAGE, &tip(), &variants).unwrap();
        store.append(score_type, &records[..1]).unwrap();
    }

    // New process over the same output directory.
    let mut store = RecordStore::new(dir.path(), variants.clone());
    let (score_type, records) = records_from_page(SAY_PAGE, &tip(), &variants).unwrap();
    let result = store.append(score_type, &records).unwrap();
    assert_eq!(result.written, 1);
    assert_eq!(result.skipped_duplicate, 1);
}
