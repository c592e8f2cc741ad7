//! Persistence tests for the RocksDB coordinate store

use netcoord::agent::{build_service, open_store};
use netcoord::common::Config;
use netcoord::coordinate::{
    Coordinate, CoordinateEntry, CoordinateStore, CoordinateUpdateRequest, QueryOptions,
    RocksStore, SegmentFilter,
};
use std::sync::Arc;
use tempfile::TempDir;

fn entry(node: &str, segment: &str, height: f64) -> CoordinateEntry {
    let mut coord = Coordinate::new(8);
    coord.height = height;
    CoordinateEntry {
        node: node.into(),
        segment: segment.into(),
        coord,
    }
}

#[test]
fn test_store_persistence() {
    let dir = TempDir::new().unwrap();

    // Write data
    {
        let store = RocksStore::open(dir.path()).unwrap();
        assert_eq!(store.apply("dc1", &[entry("foo", "", 0.1), entry("foo", "alpha", 0.2)]).unwrap(), 1);
        assert_eq!(store.apply("dc1", &[entry("bar", "", 0.3)]).unwrap(), 2);
        store.flush().unwrap();
    }

    // Reopen and verify
    {
        let store = RocksStore::open(dir.path()).unwrap();
        assert_eq!(store.index(), 2);
        let snapshot = store.list("dc1").unwrap();
        assert_eq!(snapshot.index, 2);
        assert_eq!(snapshot.records.len(), 3);

        let foo = store.node("dc1", "foo").unwrap();
        assert_eq!(foo.records.len(), 2);
        assert!(foo.records.iter().all(|r| r.modify_index == 1));

        assert!(store.list("dc2").unwrap().records.is_empty());
    }
}

#[test]
fn test_purge_survives_reopen() {
    let dir = TempDir::new().unwrap();

    {
        let store = RocksStore::open(dir.path()).unwrap();
        store.apply("dc1", &[entry("foo", "", 0.1), entry("foo", "alpha", 0.2), entry("foobar", "", 0.3)]).unwrap();
        assert_eq!(store.delete_node("dc1", "foo").unwrap(), 2);
    }

    {
        let store = RocksStore::open(dir.path()).unwrap();
        let snapshot = store.list("dc1").unwrap();
        let names: Vec<&str> = snapshot.records.iter().map(|r| r.node.as_str()).collect();
        // prefix scan must not treat "foobar" as part of "foo"
        assert_eq!(names, vec!["foobar"]);
        assert_eq!(snapshot.index, 2);
    }
}

#[tokio::test]
async fn test_pending_updates_flushed_on_shutdown() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.datacenter = "dc1".into();
    config.server.db_path = Some(dir.path().to_path_buf());
    config.coordinate.update_period_ms = 3_600_000;

    {
        let store = open_store(&config).unwrap();
        let service = build_service(&config, store);
        service
            .update(CoordinateUpdateRequest {
                datacenter: String::new(),
                node: "node1".into(),
                segment: String::new(),
                coord: Coordinate::new(8),
            })
            .await
            .unwrap();
        let epoch = service.coalescer().shutdown().await.unwrap();
        assert_eq!(epoch.index, 1);
        assert_eq!(epoch.keys, 1);
    }

    let store: Arc<dyn CoordinateStore> = open_store(&config).unwrap();
    let service = build_service(&config, store);
    let result = service
        .node("dc1", "node1", &SegmentFilter::Any, QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(result.index, 1);
    assert_eq!(result.coordinates.len(), 1);
    service.coalescer().shutdown().await.unwrap();
}
