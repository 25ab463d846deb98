use std::fs;

use tipster_adapters::{ArchiveDetailFetcher, DetailFetcher, FetchError};
use tipster_core::{CanonicalRaceId, Grade, Surface};

const PREDICTION_PAGE: &str = r#"<html><body>
  <div class="YosoDetail">
    <a href="https://race.netkeiba.com/race/shutuba.html?race_id=202505050211">出馬表</a>
  </div>
</body></html>"#;

const RACE_PAGE: &str = r#"<html><body>
  <h1 class="RaceName">アルゼンチン共和国杯<span class="Icon_GradeType Icon_GradeType2"></span></h1>
  <div class="RaceData01">15:40発走 / 芝2500m (左) / 天候:晴 / 馬場:良</div>
  <div class="RaceData02"><span>5回</span> <span>東京</span> <span>2日目</span> <span>18頭</span></div>
</body></html>"#;

#[tokio::test]
async fn archived_pages_replay_resolution_and_enrichment() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("prediction_5528852.html"), PREDICTION_PAGE).unwrap();
    fs::write(dir.path().join("race_202505050211.html"), RACE_PAGE).unwrap();
    let fetcher = ArchiveDetailFetcher::new(dir.path());

    let race = fetcher.fetch_prediction(5528852).await.unwrap();
    assert_eq!(race.as_str(), "202505050211");

    let attrs = fetcher.fetch_race(&race).await.unwrap();
    assert_eq!(attrs.grade, Some(Grade::G2));
    assert_eq!(attrs.surface, Some(Surface::Turf));
    assert_eq!(attrs.distance_m, Some(2500));
    assert_eq!(attrs.field_size, Some(18));
}

#[tokio::test]
async fn missing_and_empty_archives_are_terminal() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("race_202505050299.html"), "<html><body></body></html>").unwrap();
    let fetcher = ArchiveDetailFetcher::new(dir.path());

    let missing = fetcher.fetch_prediction(1).await.unwrap_err();
    assert_eq!(missing, FetchError::NotFound { key: "1".into() });
    assert!(!missing.is_transient());

    let empty = CanonicalRaceId::parse("202505050299").unwrap();
    let err = fetcher.fetch_race(&empty).await.unwrap_err();
    assert!(matches!(err, FetchError::ParseFailure { .. }));
}
