//! Merge and replace schema plans against a live collection.

mod common;

use anyhow::Result;
use common::{table_config, TestHarness};
use search_table::{
    ConnectorError, FieldDescriptor, FieldType, Fault, Schema, SchemaOperation, VERSION_FIELD,
};

fn fields(raw: &str) -> Schema {
    Schema::parse_field_list("id", raw).expect("valid field list")
}

async fn ready_table(harness: &TestHarness) -> Result<()> {
    harness.manager.define_table("quotes", table_config()).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn merge_adds_and_replaces_but_never_deletes() -> Result<()> {
    let harness = TestHarness::start();
    ready_table(&harness).await?;
    let manager = &harness.manager;

    assert!(
        manager
            .apply_schema("quotes", &fields("price:double,volume:long"), true)
            .await?
    );
    assert!(
        manager
            .apply_schema("quotes", &fields("price:float,symbol:string"), true)
            .await?
    );

    manager.invalidate_schema("quotes").await;
    let schema = manager.current_schema("quotes").await?;
    assert_eq!(
        schema.field("price").map(|f| &f.field_type),
        Some(&FieldType::Float)
    );
    assert!(schema.contains("volume"));
    assert!(schema.contains("symbol"));
    assert!(schema.contains("id"));
    assert!(schema.contains(VERSION_FIELD));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replace_keeps_only_protected_and_desired_fields() -> Result<()> {
    let harness = TestHarness::start();
    ready_table(&harness).await?;
    let manager = &harness.manager;
    manager
        .apply_schema("quotes", &fields("price:double,volume:long"), true)
        .await?;

    assert!(
        manager
            .apply_schema("quotes", &fields("symbol:string:multivalued"), false)
            .await?
    );

    let cached = manager.current_schema("quotes").await?;
    manager.invalidate_schema("quotes").await;
    let remote = manager.current_schema("quotes").await?;
    assert_eq!(cached, remote);

    let mut names = remote.field_names();
    names.sort_unstable();
    assert_eq!(names, vec!["_version_", "id", "symbol"]);
    assert!(remote.field("symbol").expect("symbol").multi_valued);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replace_redeclaring_the_unique_key_replaces_it_in_place() -> Result<()> {
    let harness = TestHarness::start();
    ready_table(&harness).await?;
    let manager = &harness.manager;

    manager
        .apply_schema("quotes", &fields("id:string:unindexed,price:double"), false)
        .await?;

    let schema = manager.current_schema("quotes").await?;
    assert_eq!(schema.unique_key(), "id");
    assert!(!schema.field("id").expect("unique key field").indexed);
    assert!(schema.contains("price"));
    assert!(schema.contains(VERSION_FIELD));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn empty_plan_skips_the_remote_call() -> Result<()> {
    let harness = TestHarness::start();
    ready_table(&harness).await?;

    let applied = harness
        .manager
        .apply_schema("quotes", &Schema::new("id"), false)
        .await?;

    assert!(!applied);
    assert_eq!(harness.cluster.stats().schema_updates, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rejected_batch_reports_status_and_leaves_cache_alone() -> Result<()> {
    let harness = TestHarness::start();
    ready_table(&harness).await?;
    let manager = &harness.manager;
    let before = manager.current_schema("quotes").await?;
    harness.cluster.inject(Fault::UpdateSchema(400));

    let err = manager
        .apply_schema("quotes", &fields("price:double"), true)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ConnectorError::SchemaUpdate { status: 400, .. }
    ));
    assert_eq!(manager.current_schema("quotes").await?, before);
    assert_eq!(manager.metrics().snapshot().schema_update_failures, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cluster_validation_errors_are_passed_through() -> Result<()> {
    let harness = TestHarness::start();
    ready_table(&harness).await?;
    let manager = &harness.manager;
    manager.current_schema("quotes").await?;
    // Another writer adds the field after our snapshot was cached.
    harness.cluster.external_schema_update(
        "quotes._default",
        &[SchemaOperation::AddField(FieldDescriptor::new(
            "price",
            FieldType::Double,
        ))],
    );

    let err = manager
        .apply_schema("quotes", &fields("price:double"), true)
        .await
        .unwrap_err();
    match err {
        ConnectorError::SchemaUpdate { messages, .. } => {
            assert_eq!(messages, vec!["Field 'price' already exists.".to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }

    manager.invalidate_schema("quotes").await;
    assert!(
        manager
            .apply_schema("quotes", &fields("price:double"), true)
            .await?
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn missing_config_set_is_schema_not_found() -> Result<()> {
    let harness = TestHarness::start();
    harness
        .manager
        .register("quotes", table_config())
        .await?;

    let err = harness.manager.current_schema("quotes").await.unwrap_err();
    assert!(matches!(err, ConnectorError::SchemaNotFound(ref c) if c == "quotes"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_applies_on_one_table_do_not_lose_updates() -> Result<()> {
    let harness = TestHarness::start();
    ready_table(&harness).await?;

    let tasks = ["alpha:long", "beta:string", "gamma:boolean"].map(|raw| {
        let manager = std::sync::Arc::clone(&harness.manager);
        tokio::spawn(async move { manager.apply_schema("quotes", &fields(raw), true).await })
    });
    for task in tasks {
        assert!(task.await??);
    }

    let cached = harness.manager.current_schema("quotes").await?;
    for name in ["alpha", "beta", "gamma"] {
        assert!(cached.contains(name), "cached schema lost {name}");
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn external_changes_appear_only_after_invalidation() -> Result<()> {
    let harness = TestHarness::start();
    ready_table(&harness).await?;
    let manager = &harness.manager;
    assert!(!manager.current_schema("quotes").await?.contains("note"));

    harness.cluster.external_schema_update(
        "quotes._default",
        &[SchemaOperation::AddField(FieldDescriptor::new(
            "note",
            FieldType::String,
        ))],
    );
    assert!(!manager.current_schema("quotes").await?.contains("note"));

    manager.invalidate_schema("quotes").await;
    assert!(manager.current_schema("quotes").await?.contains("note"));
    Ok(())
}
