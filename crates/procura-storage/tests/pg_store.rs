// Runs against a live Postgres when DATABASE_URL is set; otherwise each test returns early.

use std::sync::Arc;

use chrono::Utc;
use procura_core::{AnalysisReport, AnalysisResult, OpportunityDraft, RiskLevel};
use procura_storage::{OpportunityStore, PgOpportunityStore, StoreError};
use serde_json::json;
use uuid::Uuid;

async fn store_from_env() -> Option<PgOpportunityStore> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let store = PgOpportunityStore::connect(&url, 8).await.ok()?;
    store.migrate().await.ok()?;
    Some(store)
}

fn draft(external_id: &str, title: &str) -> OpportunityDraft {
    OpportunityDraft {
        external_id: external_id.into(),
        title: title.into(),
        description: "Conference space and lodging".into(),
        posted_at: Some(Utc::now()),
        classification_code: Some("721110".into()),
        category: Some("Combined Synopsis/Solicitation".into()),
        organization: Some("GENERAL SERVICES ADMINISTRATION".into()),
        payload: json!({"noticeId": external_id, "title": title}),
    }
}

fn unique_id(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4().simple())
}

#[tokio::test]
async fn upsert_is_idempotent_per_external_id() {
    let Some(store) = store_from_env().await else {
        return;
    };
    let external_id = unique_id("PGTEST");

    let first = store.upsert(&draft(&external_id, "First"), Utc::now()).await.unwrap();
    let second = store.upsert(&draft(&external_id, "Second"), Utc::now()).await.unwrap();

    assert!(first.inserted);
    assert!(!second.inserted);
    assert_eq!(first.id, second.id);

    let row = store.find_by_external_id(&external_id).await.unwrap().unwrap();
    assert_eq!(row.title, "Second");
    assert_eq!(
        row.cached_payload.as_ref().and_then(|p| p["title"].as_str()),
        Some("Second")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_upserts_converge_on_one_row() {
    let Some(store) = store_from_env().await else {
        return;
    };
    let store = Arc::new(store);
    let external_id = unique_id("PGRACE");

    let mut handles = Vec::new();
    for i in 0..12 {
        let store = store.clone();
        let external_id = external_id.clone();
        handles.push(tokio::spawn(async move {
            store
                .upsert(&draft(&external_id, &format!("writer {i}")), Utc::now())
                .await
                .unwrap()
        }));
    }
    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.unwrap());
    }

    assert!(outcomes.iter().all(|o| o.id == outcomes[0].id));
    assert_eq!(outcomes.iter().filter(|o| o.inserted).count(), 1);

    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM opportunities WHERE external_id = $1")
        .bind(&external_id)
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(rows, 1);
}

#[tokio::test]
async fn analysis_results_reference_stored_opportunities() {
    let Some(store) = store_from_env().await else {
        return;
    };
    let external_id = unique_id("PGANALYSIS");
    let batch_id = Uuid::new_v4();
    let report = AnalysisReport {
        confidence_score: 0.65,
        risk_level: RiskLevel::High,
        priority_score: 5.0,
        recommendations: vec!["Confirm room block".into()],
        ..Default::default()
    };
    let result = AnalysisResult::completed(batch_id, &external_id, report, Utc::now());

    assert!(matches!(
        store.record_analysis(&result).await,
        Err(StoreError::UnknownOpportunity(_))
    ));

    store.upsert(&draft(&external_id, "Venue"), Utc::now()).await.unwrap();
    assert!(store.record_analysis(&result).await.unwrap());
    assert!(!store.record_analysis(&result).await.unwrap());
}
