//! Integration tests for the registry storage service

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use imagestore::{Digest, ImageStore, OCI_MANIFEST, ScrubStatus};
use parking_lot::Mutex;
use registry::{Config, RegistryBuilder};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    fn text(&self) -> String {
        String::from_utf8(self.0.lock().clone()).unwrap()
    }
}

impl io::Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn captured_dispatch() -> (Captured, tracing::Dispatch) {
    let captured = Captured::default();
    let writer = captured.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .finish();
    (captured, tracing::Dispatch::new(subscriber))
}

fn config(root: &Utf8Path, extra: &str) -> Config {
    Config::from_toml(&format!(
        r#"
        [storage]
        root_directory = "{root}"

        [scheduler]
        num_workers = 2

        {extra}
        "#
    ))
    .unwrap()
}

fn temp_root() -> (tempfile::TempDir, Utf8PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    (dir, root)
}

async fn put(store: &dyn ImageStore, repo: &str, content: &[u8]) -> Digest {
    let digest = Digest::sha256(content);
    let mut reader = content;
    store
        .put_blob(repo, &digest, &mut reader, &CancellationToken::new())
        .await
        .unwrap();
    digest
}

/// Push a one-layer image, returning the layer digest.
async fn push_image(store: &dyn ImageStore, repo: &str, tag: &str, layer: &[u8]) -> Digest {
    let config = put(store, repo, b"{}").await;
    let layer_digest = put(store, repo, layer).await;
    let body = format!(
        r#"{{"schemaVersion":2,"config":{{"mediaType":"application/vnd.oci.image.config.v1+json","digest":"{config}","size":2}},"layers":[{{"mediaType":"application/vnd.oci.image.layer.v1.tar","digest":"{layer_digest}","size":{}}}]}}"#,
        layer.len()
    );
    store
        .put_manifest(repo, tag, OCI_MANIFEST, Bytes::from(body))
        .await
        .unwrap();
    layer_digest
}

async fn wait_for_log(captured: &Captured, needle: &str) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !captured.text().contains(needle) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("log never contained {needle:?}:\n{}", captured.text()));
}

#[tokio::test]
async fn test_default_cache_dedupes_across_repositories() {
    let (_dir, root) = temp_root();
    let registry = RegistryBuilder::new(config(&root, "")).build().await.unwrap();
    let store = registry.store().as_ref();

    let layer = push_image(store, "alpine", "latest", b"shared layer").await;
    push_image(store, "library/alpine", "latest", b"shared layer").await;

    assert!(root.join("cache.db").is_file());

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        let a = std::fs::metadata(root.join("alpine").join(layer.blob_path())).unwrap();
        let b = std::fs::metadata(root.join("library/alpine").join(layer.blob_path())).unwrap();
        assert_eq!(a.ino(), b.ino());
        assert_eq!(a.nlink(), 2);
    }

    assert_eq!(store.list_repos().await.unwrap(), vec!["alpine", "library/alpine"]);
}

#[tokio::test]
async fn test_dedupe_disabled_copies_content() {
    let (_dir, root) = temp_root();
    let config = Config::from_toml(&format!(
        "[storage]\nroot_directory = \"{root}\"\ndedupe = false\n"
    ))
    .unwrap();
    let registry = RegistryBuilder::new(config).build().await.unwrap();
    let store = registry.store().as_ref();

    let layer = push_image(store, "a", "v1", b"layer").await;
    push_image(store, "b", "v1", b"layer").await;

    assert!(!root.join("cache.db").exists());
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        let a = std::fs::metadata(root.join("a").join(layer.blob_path())).unwrap();
        assert_eq!(a.nlink(), 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_scrub_extension_reports_damage() {
    let (_dir, root) = temp_root();
    let config = config(
        &root,
        r#"
        [extensions.scrub]
        enable = true
        interval = "50ms"
        "#,
    );
    let (captured, dispatch) = captured_dispatch();
    let registry = RegistryBuilder::new(config)
        .dispatch(dispatch)
        .build()
        .await
        .unwrap();
    let store = registry.store().clone();

    push_image(store.as_ref(), "busybox", "stable", b"busybox layer").await;
    let lost = push_image(store.as_ref(), "alpine", "broken", b"alpine layer").await;
    std::fs::remove_file(root.join("alpine").join(lost.blob_path())).unwrap();

    let cancel = CancellationToken::new();
    let handle = {
        let registry = registry.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { registry.run(cancel).await })
    };

    wait_for_log(&captured, "scrub: blobs/manifest affected").await;
    wait_for_log(&captured, "scrub: blobs/manifest ok").await;

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    let output = captured.text();
    assert!(output.contains(&format!("affected_blob={lost}")), "{output}");
    assert!(output.contains("scheduler stopped"), "{output}");

    let results = store
        .check_repo(&CancellationToken::new(), "alpine", Default::default())
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, ScrubStatus::Affected);
    assert_eq!(results[0].affected_blob.as_ref(), Some(&lost));
}

#[tokio::test]
async fn test_scrub_isolates_damaged_tag() {
    let (_dir, root) = temp_root();
    let registry = RegistryBuilder::new(config(&root, "")).build().await.unwrap();
    let store = registry.store().as_ref();

    let mut layers = Vec::new();
    for n in 0..10 {
        let layer = format!("layer {n}");
        layers.push(push_image(store, "alpine", &format!("v{n}"), layer.as_bytes()).await);
    }
    std::fs::remove_file(root.join("alpine").join(layers[3].blob_path())).unwrap();

    let results = registry::extensions::run_scrub_repo(
        &CancellationToken::new(),
        store,
        "alpine",
        Default::default(),
    )
    .await
    .unwrap();

    assert_eq!(results.len(), 10);
    let affected: Vec<_> = results.iter().filter(|r| !r.is_ok()).collect();
    assert_eq!(affected.len(), 1);
    assert_eq!(affected[0].tag, "v3");
    assert_eq!(affected[0].affected_blob.as_ref(), Some(&layers[3]));
}

#[tokio::test]
async fn test_invalid_scheduler_config_fails_build() {
    let (_dir, root) = temp_root();
    let config = Config::from_toml(&format!(
        "[storage]\nroot_directory = \"{root}\"\n[scheduler]\nnum_workers = 0\n"
    ))
    .unwrap();

    let err = RegistryBuilder::new(config).build().await.unwrap_err();
    assert!(matches!(err, registry::RegistryError::Scheduler(_)));
}
