mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{parse_failure, prediction, race, store, ScriptedFetcher};
use tipster_adapters::{FetchError, RetryingFetcher};
use tipster_core::{Grade, RaceKey, RaceRowId};
use tipster_storage::BackoffPolicy;
use tipster_sync::{ResolveFailure, ResolveOutcome, Resolver};

#[tokio::test]
async fn placeholder_resolves_in_place_when_id_is_new() {
    let store = store().await;
    let predictor = store.upsert_predictor(7, "Tipster Seven").await.unwrap();
    let placeholder = race(&store, "temp_7_101").await;
    prediction(&store, predictor, placeholder, Some(5528852)).await;

    let fetcher = Arc::new(ScriptedFetcher::new().prediction(5528852, "202505050211"));
    let resolver = Resolver::new(store.clone(), fetcher.clone());

    assert_eq!(resolver.resolve(placeholder).await.unwrap(), ResolveOutcome::Updated);

    let resolved = store.race_by_key("202505050211").await.unwrap().unwrap();
    assert_eq!(resolved.id, placeholder);
    assert_eq!(store.predictions_for_race(resolved.id).await.unwrap().len(), 1);
    assert!(store.race_by_key("temp_7_101").await.unwrap().is_none());
}

#[tokio::test]
async fn placeholder_merges_into_existing_race() {
    let store = store().await;
    let predictor = store.upsert_predictor(7, "Tipster Seven").await.unwrap();
    let other = store.upsert_predictor(8, "Tipster Eight").await.unwrap();

    let existing = race(&store, "202505050211").await;
    for key in [1001, 1002, 1003] {
        prediction(&store, other, existing, Some(key)).await;
    }
    let placeholder = race(&store, "temp_7_101").await;
    prediction(&store, predictor, placeholder, Some(5528852)).await;

    let fetcher = ScriptedFetcher::new().prediction(5528852, "202505050211");
    let resolver = Resolver::new(store.clone(), fetcher);

    assert_eq!(
        resolver.resolve(placeholder).await.unwrap(),
        ResolveOutcome::Merged {
            into: existing,
            moved_predictions: 1
        }
    );

    let backlog = store.backlog(3).await.unwrap();
    assert_eq!(backlog.races, 1);
    assert_eq!(backlog.placeholders, 0);
    assert!(store.race(placeholder).await.unwrap().is_none());
    assert_eq!(store.predictions_for_race(existing).await.unwrap().len(), 4);
}

#[tokio::test]
async fn merge_moves_every_child_of_the_placeholder() {
    let store = store().await;
    let predictor = store.upsert_predictor(7, "Tipster Seven").await.unwrap();

    let canonical = race(&store, "202505050211").await;
    let p3 = prediction(&store, predictor, canonical, Some(3)).await;
    let placeholder = race(&store, "temp_7_1").await;
    let p1 = prediction(&store, predictor, placeholder, Some(1)).await;
    let p2 = prediction(&store, predictor, placeholder, None).await;

    let resolver = Resolver::new(store.clone(), ScriptedFetcher::new().prediction(1, "202505050211"));
    assert!(matches!(
        resolver.resolve(placeholder).await.unwrap(),
        ResolveOutcome::Merged { moved_predictions: 2, .. }
    ));

    let mut owned: Vec<_> = store
        .predictions_for_race(canonical)
        .await
        .unwrap()
        .into_iter()
        .map(|p| p.id)
        .collect();
    owned.sort();
    let mut expected = vec![p1, p2, p3];
    expected.sort();
    assert_eq!(owned, expected);

    let stats = store.predictor(predictor).await.unwrap().unwrap();
    assert_eq!(stats.total_predictions, 3);
}

#[tokio::test]
async fn parse_failure_leaves_the_race_untouched() {
    let store = store().await;
    let predictor = store.upsert_predictor(7, "Tipster Seven").await.unwrap();
    let placeholder = race(&store, "temp_7_101").await;
    prediction(&store, predictor, placeholder, Some(5528852)).await;
    let before = store.race(placeholder).await.unwrap();

    let resolver = Resolver::new(
        store.clone(),
        ScriptedFetcher::new().prediction_error(5528852, parse_failure("5528852")),
    );

    assert_eq!(
        resolver.resolve(placeholder).await.unwrap(),
        ResolveOutcome::Failed(ResolveFailure::Fetch(parse_failure("5528852")))
    );
    assert_eq!(store.race(placeholder).await.unwrap(), before);
    assert_eq!(store.backlog(3).await.unwrap().placeholders, 1);
}

#[tokio::test]
async fn resolving_twice_is_a_no_op() {
    let store = store().await;
    let predictor = store.upsert_predictor(7, "Tipster Seven").await.unwrap();
    let placeholder = race(&store, "temp_7_101").await;
    prediction(&store, predictor, placeholder, Some(5528852)).await;

    let fetcher = Arc::new(ScriptedFetcher::new().prediction(5528852, "202505050211"));
    let resolver = Resolver::new(store.clone(), fetcher.clone());

    assert_eq!(resolver.resolve(placeholder).await.unwrap(), ResolveOutcome::Updated);
    assert_eq!(resolver.resolve(placeholder).await.unwrap(), ResolveOutcome::Updated);
    assert_eq!(fetcher.calls(), 1);

    assert_eq!(resolver.resolve(RaceRowId(9999)).await.unwrap(), ResolveOutcome::Updated);
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn two_placeholders_for_one_race_converge_on_a_single_row() {
    let store = store().await;
    let seven = store.upsert_predictor(7, "Tipster Seven").await.unwrap();
    let eight = store.upsert_predictor(8, "Tipster Eight").await.unwrap();
    let first = race(&store, "temp_7_1").await;
    let second = race(&store, "temp_8_2").await;
    prediction(&store, seven, first, Some(11)).await;
    prediction(&store, eight, second, Some(12)).await;

    let resolver = Resolver::new(
        store.clone(),
        ScriptedFetcher::new()
            .prediction(11, "202505050211")
            .prediction(12, "202505050211"),
    );

    assert_eq!(resolver.resolve(first).await.unwrap(), ResolveOutcome::Updated);
    assert!(matches!(
        resolver.resolve(second).await.unwrap(),
        ResolveOutcome::Merged { into, .. } if into == first
    ));

    let backlog = store.backlog(3).await.unwrap();
    assert_eq!(backlog.races, 1);
    assert_eq!(store.predictions_for_race(first).await.unwrap().len(), 2);
}

#[tokio::test]
async fn race_without_lookup_key_cannot_be_resolved() {
    let store = store().await;
    let predictor = store.upsert_predictor(7, "Tipster Seven").await.unwrap();
    let placeholder = race(&store, "temp_7_101").await;
    prediction(&store, predictor, placeholder, None).await;

    let fetcher = Arc::new(ScriptedFetcher::new());
    let resolver = Resolver::new(store.clone(), fetcher.clone());

    assert_eq!(
        resolver.resolve(placeholder).await.unwrap(),
        ResolveOutcome::Failed(ResolveFailure::NoLookupKey)
    );
    assert_eq!(fetcher.calls(), 0);
}

#[tokio::test]
async fn transient_errors_surface_only_after_the_fetcher_gives_up() {
    let store = store().await;
    let predictor = store.upsert_predictor(7, "Tipster Seven").await.unwrap();
    let placeholder = race(&store, "temp_7_101").await;
    prediction(&store, predictor, placeholder, Some(5528852)).await;

    let timeout = FetchError::Timeout { key: "5528852".into() };
    let scripted = Arc::new(ScriptedFetcher::new().prediction_error(5528852, timeout.clone()));
    let policy = BackoffPolicy {
        max_retries: 2,
        base_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
    };
    let resolver = Resolver::new(store.clone(), RetryingFetcher::new(scripted.clone(), policy));

    assert_eq!(
        resolver.resolve(placeholder).await.unwrap(),
        ResolveOutcome::Failed(ResolveFailure::Fetch(timeout))
    );
    assert_eq!(scripted.calls(), 3);
    assert!(store.race(placeholder).await.unwrap().unwrap().is_placeholder());
}

#[tokio::test]
async fn merge_refreshes_counts_of_predictors_already_on_the_survivor() {
    let store = store().await;
    let resident = store.upsert_predictor(8, "Tipster Eight").await.unwrap();
    let newcomer = store.upsert_predictor(7, "Tipster Seven").await.unwrap();

    let existing = race(&store, "202505050211").await;
    prediction(&store, resident, existing, Some(1001)).await;
    let placeholder = store
        .insert_race(&RaceKey::parse("temp_7_101").unwrap(), "アルゼンチン共和国杯", Some(Grade::G2))
        .await
        .unwrap();
    prediction(&store, newcomer, placeholder, Some(5528852)).await;
    assert_eq!(store.predictor(resident).await.unwrap().unwrap().grade_predictions, 0);

    let resolver = Resolver::new(store.clone(), ScriptedFetcher::new().prediction(5528852, "202505050211"));
    assert!(matches!(
        resolver.resolve(placeholder).await.unwrap(),
        ResolveOutcome::Merged { into, .. } if into == existing
    ));

    assert_eq!(store.race(existing).await.unwrap().unwrap().grade, Some(Grade::G2));
    let resident = store.predictor(resident).await.unwrap().unwrap();
    let newcomer = store.predictor(newcomer).await.unwrap().unwrap();
    assert_eq!(resident.grade_predictions, 1);
    assert_eq!(resident.total_predictions, 1);
    assert_eq!(newcomer.grade_predictions, 1);
}

#[tokio::test]
async fn merge_that_fails_midway_rolls_back_completely() {
    let store = store().await;
    let predictor = store.upsert_predictor(7, "Tipster Seven").await.unwrap();
    let other = store.upsert_predictor(8, "Tipster Eight").await.unwrap();

    let existing = race(&store, "202505050211").await;
    prediction(&store, other, existing, Some(1001)).await;
    let placeholder = race(&store, "temp_7_101").await;
    let child = prediction(&store, predictor, placeholder, Some(5528852)).await;

    sqlx::query(
        "CREATE TRIGGER block_race_delete BEFORE DELETE ON races \
         BEGIN SELECT RAISE(ABORT, 'race deletes blocked'); END",
    )
    .execute(store.pool())
    .await
    .unwrap();

    let resolver = Resolver::new(store.clone(), ScriptedFetcher::new().prediction(5528852, "202505050211"));
    assert!(resolver.resolve(placeholder).await.is_err());

    let kept = store.race(placeholder).await.unwrap().unwrap();
    assert_eq!(kept.key.to_string(), "temp_7_101");
    let children: Vec<_> = store
        .predictions_for_race(placeholder)
        .await
        .unwrap()
        .into_iter()
        .map(|p| p.id)
        .collect();
    assert_eq!(children, vec![child]);
    assert_eq!(store.predictions_for_race(existing).await.unwrap().len(), 1);

    sqlx::query("DROP TRIGGER block_race_delete")
        .execute(store.pool())
        .await
        .unwrap();

    assert_eq!(
        resolver.resolve(placeholder).await.unwrap(),
        ResolveOutcome::Merged {
            into: existing,
            moved_predictions: 1
        }
    );
    assert!(store.race(placeholder).await.unwrap().is_none());
    assert_eq!(store.predictions_for_race(existing).await.unwrap().len(), 2);
    assert_eq!(store.backlog(3).await.unwrap().races, 1);
}
