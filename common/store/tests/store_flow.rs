//! Idempotent-store tests against a live Postgres. Gated behind the
//! `integration-tests` feature; set DATABASE_URL before running.
#![cfg(feature = "integration-tests")]

use chrono::{Duration as ChronoDuration, Utc};
use common_store::{
    EmailInput, PersonInput, ResolutionInput, Store, VerificationInput, VerifyStatus,
};
use uuid::Uuid;

async fn store() -> Store {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let store = Store::connect(&url, 4).await.unwrap();
    store.run_migrations().await.unwrap();
    store
}

async fn tenant(store: &Store) -> Uuid {
    let id = Uuid::new_v4();
    store.ensure_tenant(id, "test-tenant").await.unwrap();
    id
}

#[tokio::test]
async fn concurrent_email_upserts_converge_on_one_row() {
    let store = store().await;
    let tenant_id = tenant(&store).await;
    let company_id = store
        .upsert_company(tenant_id, None, "Example", Some("example.com"))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .upsert_email(
                    tenant_id,
                    company_id,
                    &EmailInput {
                        email: "jane.doe@example.com".to_string(),
                        is_published: false,
                        ..Default::default()
                    },
                )
                .await
                .unwrap()
        }));
    }
    let ids: Vec<Uuid> = futures_join(handles).await;
    assert!(ids.windows(2).all(|w| w[0] == w[1]), "all writers observe the same id");
}

async fn futures_join(handles: Vec<tokio::task::JoinHandle<Uuid>>) -> Vec<Uuid> {
    let mut out = Vec::new();
    for h in handles {
        out.push(h.await.unwrap());
    }
    out
}

#[tokio::test]
async fn published_flag_is_never_downgraded() {
    let store = store().await;
    let tenant_id = tenant(&store).await;
    let company_id = store
        .upsert_company(tenant_id, None, "Example", Some("pub-flag.test"))
        .await
        .unwrap();

    let input = |published| EmailInput {
        email: "jane@pub-flag.test".to_string(),
        is_published: published,
        ..Default::default()
    };
    let id = store.upsert_email(tenant_id, company_id, &input(true)).await.unwrap();
    let same = store.upsert_email(tenant_id, company_id, &input(false)).await.unwrap();
    assert_eq!(id, same);

    let row = store.get_email(tenant_id, id).await.unwrap().unwrap();
    assert!(row.is_published);
}

#[tokio::test]
async fn email_key_is_case_insensitive_per_tenant() {
    let store = store().await;
    let tenant_a = tenant(&store).await;
    let tenant_b = tenant(&store).await;
    let company_a = store
        .upsert_company(tenant_a, None, "A", Some("case.test"))
        .await
        .unwrap();
    let company_b = store
        .upsert_company(tenant_b, None, "B", Some("case.test"))
        .await
        .unwrap();

    let input = |email: &str| EmailInput { email: email.to_string(), ..Default::default() };
    let lower = store.upsert_email(tenant_a, company_a, &input("x@case.test")).await.unwrap();
    let upper = store.upsert_email(tenant_a, company_a, &input("X@case.test")).await.unwrap();
    assert_eq!(lower, upper);

    // The same address under another tenant is a distinct row.
    let other = store.upsert_email(tenant_b, company_b, &input("x@case.test")).await.unwrap();
    assert_ne!(lower, other);
}

#[tokio::test]
async fn latest_verification_orders_by_time_then_id() {
    let store = store().await;
    let tenant_id = tenant(&store).await;
    let company_id = store
        .upsert_company(tenant_id, None, "Latest", Some("latest.test"))
        .await
        .unwrap();
    let email_id = store
        .upsert_email(
            tenant_id,
            company_id,
            &EmailInput { email: "a@latest.test".to_string(), ..Default::default() },
        )
        .await
        .unwrap();

    let older = VerificationInput {
        verify_status: VerifyStatus::Invalid,
        verify_reason: "rcpt_5xx".to_string(),
        verified_at: Some(Utc::now() - ChronoDuration::hours(2)),
        ..Default::default()
    };
    let newer = VerificationInput {
        verify_status: VerifyStatus::Valid,
        verify_reason: "rcpt_2xx_non_catchall".to_string(),
        verified_at: Some(Utc::now()),
        ..Default::default()
    };
    store.append_verification(tenant_id, email_id, &newer).await.unwrap();
    store.append_verification(tenant_id, email_id, &older).await.unwrap();

    let latest = store.latest_verification(tenant_id, email_id).await.unwrap().unwrap();
    assert_eq!(latest.verify_status, "valid");

    // Identical timestamps tie-break on the higher row id.
    let ts = Utc::now();
    let tie = |reason: &str| VerificationInput {
        verify_status: VerifyStatus::UnknownTimeout,
        verify_reason: reason.to_string(),
        verified_at: Some(ts),
        ..Default::default()
    };
    store.append_verification(tenant_id, email_id, &tie("first")).await.unwrap();
    store.append_verification(tenant_id, email_id, &tie("second")).await.unwrap();
    let latest = store.latest_verification(tenant_id, email_id).await.unwrap().unwrap();
    assert_eq!(latest.verify_reason, "second");
}

#[tokio::test]
async fn emails_needing_verification_skips_conclusive_latest() {
    let store = store().await;
    let tenant_id = tenant(&store).await;
    let company_id = store
        .upsert_company(tenant_id, None, "Needs", Some("needs.test"))
        .await
        .unwrap();

    let make = |email: &str| EmailInput { email: email.to_string(), ..Default::default() };
    let settled = store.upsert_email(tenant_id, company_id, &make("done@needs.test")).await.unwrap();
    let fresh = store.upsert_email(tenant_id, company_id, &make("new@needs.test")).await.unwrap();
    let unknown = store.upsert_email(tenant_id, company_id, &make("meh@needs.test")).await.unwrap();

    store
        .append_verification(
            tenant_id,
            settled,
            &VerificationInput {
                verify_status: VerifyStatus::Valid,
                verify_reason: "rcpt_2xx_non_catchall".to_string(),
                verified_at: Some(Utc::now()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    store
        .append_verification(
            tenant_id,
            unknown,
            &VerificationInput {
                verify_status: VerifyStatus::UnknownTimeout,
                verify_reason: "timeout".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let pending = store.emails_needing_verification(tenant_id, company_id).await.unwrap();
    let ids: Vec<Uuid> = pending.iter().map(|e| e.id).collect();
    assert!(ids.contains(&fresh));
    assert!(ids.contains(&unknown));
    assert!(!ids.contains(&settled));
}

#[tokio::test]
async fn person_upsert_merges_instead_of_duplicating() {
    let store = store().await;
    let tenant_id = tenant(&store).await;
    let company_id = store
        .upsert_company(tenant_id, None, "People", Some("people.test"))
        .await
        .unwrap();

    let bare = PersonInput { full_name: "Jane Doe".to_string(), ..Default::default() };
    let titled = PersonInput {
        full_name: "jane doe".to_string(),
        title: Some("CTO".to_string()),
        ..Default::default()
    };
    let a = store.upsert_person(tenant_id, company_id, &bare).await.unwrap();
    let b = store.upsert_person(tenant_id, company_id, &titled).await.unwrap();
    assert_eq!(a, b, "case-insensitive full-name key");
    assert_eq!(store.count_people(tenant_id, company_id).await.unwrap(), 1);
}

#[tokio::test]
async fn catchall_verdict_lands_on_latest_resolution() {
    let store = store().await;
    let tenant_id = tenant(&store).await;

    store
        .insert_resolution(
            tenant_id,
            None,
            &ResolutionInput {
                chosen_domain: "verdict.test".to_string(),
                method: Some("mx".to_string()),
                mx_hosts: vec!["mx1.verdict.test".to_string()],
                lowest_mx: Some("mx1.verdict.test".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    store
        .set_catchall_verdict(
            tenant_id,
            "verdict.test",
            common_store::CatchAllStatus::NotCatchAll,
            Some("f00dfeed"),
            Some(550),
        )
        .await
        .unwrap();

    let row = store.latest_resolution(tenant_id, "verdict.test").await.unwrap().unwrap();
    assert_eq!(row.catch_all_status(), Some(common_store::CatchAllStatus::NotCatchAll));
    assert_eq!(row.catch_all_smtp_code, Some(550));
    assert!(row.catch_all_checked_at.is_some());
}
