use std::path::Path;

use mfr_sync::{secret_needs, FeedRegistry, StorageKind};

#[tokio::test]
async fn workspace_feed_registry_loads() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../feeds.yaml");
    let registry = FeedRegistry::load(&path).await.unwrap();

    let names = registry.feeds.iter().map(|f| f.name.as_str()).collect::<Vec<_>>();
    assert_eq!(names, vec!["blob-generic", "fileshare-generic", "elective-recovery"]);

    let elective = &registry.feeds[2];
    assert_eq!(elective.storage.kind, StorageKind::Fileshare);
    assert!(elective.schema.passthrough);
    assert!(elective.target.is_none() && elective.archive_path.is_none() && elective.audit_source.is_none());

    let needs = secret_needs(registry.enabled());
    assert!(needs.blob && needs.fileshare);
}
