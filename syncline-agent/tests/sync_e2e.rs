//! Full-pipeline tests: two folder agents against an in-process relay.

use std::path::Path;
use std::time::Duration;

use syncline_agent::{AgentConfig, FolderAgent};
use syncline_relay::compaction::compact_doc;
use syncline_relay::{RelayConfig, RelayServer, RelayState};
use tokio::task::JoinHandle;

/// Start a relay on an ephemeral port; returns its ws URL.
async fn start_relay() -> (String, RelayState, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let server = RelayServer::open(RelayConfig {
        port: 0,
        db_path: dir.path().join("syncline.db"),
        ..RelayConfig::default()
    })
    .unwrap();
    let state = server.state();
    let listener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server.serve(listener));
    (format!("ws://{addr}/sync"), state, dir)
}

/// Spawn an agent with test-friendly timing (short debounce, matching
/// grace).
fn start_agent(dir: &Path, url: &str, name: &str) -> JoinHandle<()> {
    let mut config = AgentConfig::new(dir, url, name);
    config.debounce = Duration::from_millis(100);
    config.write_grace = Duration::from_millis(300);
    let agent = FolderAgent::new(config).unwrap();
    tokio::spawn(async move {
        let _ = agent.run().await;
    })
}

/// Poll until `cond` holds; panics after `secs` seconds.
async fn wait_until(secs: u64, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(secs);
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached within {secs}s");
}

fn read_text(path: &Path) -> Option<String> {
    std::fs::read_to_string(path).ok()
}

#[tokio::test]
async fn text_edits_propagate_both_ways() {
    let (url, _state, _relay_dir) = start_relay().await;
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let _a = start_agent(dir_a.path(), &url, "A");
    let _b = start_agent(dir_b.path(), &url, "B");
    tokio::time::sleep(Duration::from_millis(600)).await;

    // A creates a note; B receives it through the index without any prior
    // knowledge of the doc.
    std::fs::write(dir_a.path().join("note.md"), "Hello").unwrap();
    wait_until(15, || {
        read_text(&dir_b.path().join("note.md")).as_deref() == Some("Hello")
    })
    .await;

    // B extends it; A converges.
    std::fs::write(dir_b.path().join("note.md"), "Hello World").unwrap();
    wait_until(15, || {
        read_text(&dir_a.path().join("note.md")).as_deref() == Some("Hello World")
    })
    .await;
}

#[tokio::test]
async fn offline_divergence_merges_without_conflict() {
    let (url, _state, _relay_dir) = start_relay().await;
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let a = start_agent(dir_a.path(), &url, "A");
    let b = start_agent(dir_b.path(), &url, "B");
    tokio::time::sleep(Duration::from_millis(600)).await;

    std::fs::write(dir_a.path().join("story.md"), "Once upon a time.").unwrap();
    wait_until(15, || {
        read_text(&dir_b.path().join("story.md")).as_deref() == Some("Once upon a time.")
    })
    .await;

    // Take both agents offline and edit opposite ends of the file.
    a.abort();
    b.abort();
    tokio::time::sleep(Duration::from_millis(200)).await;
    std::fs::write(
        dir_a.path().join("story.md"),
        "Deep in the forest, Once upon a time.",
    )
    .unwrap();
    std::fs::write(
        dir_b.path().join("story.md"),
        "Once upon a time. The End.",
    )
    .unwrap();

    let _a = start_agent(dir_a.path(), &url, "A");
    let _b = start_agent(dir_b.path(), &url, "B");

    let merged = "Deep in the forest, Once upon a time. The End.";
    wait_until(20, || {
        read_text(&dir_a.path().join("story.md")).as_deref() == Some(merged)
            && read_text(&dir_b.path().join("story.md")).as_deref() == Some(merged)
    })
    .await;
}

#[tokio::test]
async fn binary_files_propagate_through_blob_pipeline() {
    let (url, _state, _relay_dir) = start_relay().await;
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let _a = start_agent(dir_a.path(), &url, "A");
    let _b = start_agent(dir_b.path(), &url, "B");
    tokio::time::sleep(Duration::from_millis(600)).await;

    let payload: Vec<u8> = (0..512u32).map(|i| (i * 7 % 251) as u8).collect();
    std::fs::write(dir_a.path().join("logo.png"), &payload).unwrap();

    wait_until(15, || {
        std::fs::read(dir_b.path().join("logo.png")).ok().as_deref() == Some(payload.as_slice())
    })
    .await;
}

#[tokio::test]
async fn binary_conflict_keeps_both_versions() {
    let (url, _state, _relay_dir) = start_relay().await;
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let a = start_agent(dir_a.path(), &url, "A");
    let b = start_agent(dir_b.path(), &url, "B");
    tokio::time::sleep(Duration::from_millis(600)).await;

    // Common ancestor everywhere.
    let h0 = vec![0u8; 64];
    std::fs::write(dir_a.path().join("logo.png"), &h0).unwrap();
    wait_until(15, || {
        std::fs::read(dir_b.path().join("logo.png")).ok().as_deref() == Some(h0.as_slice())
    })
    .await;

    // Diverge offline: A writes first, B later (later mtime wins).
    a.abort();
    b.abort();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let h1 = vec![1u8; 64];
    let h2 = vec![2u8; 64];
    std::fs::write(dir_a.path().join("logo.png"), &h1).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    std::fs::write(dir_b.path().join("logo.png"), &h2).unwrap();

    let _a = start_agent(dir_a.path(), &url, "A");
    let _b = start_agent(dir_b.path(), &url, "B");

    // Both sides converge on B's bytes under the original name and keep
    // A's bytes under the conflict name. No data loss.
    wait_until(25, || {
        let winner_a = std::fs::read(dir_a.path().join("logo.png")).ok();
        let winner_b = std::fs::read(dir_b.path().join("logo.png")).ok();
        let loser_a = std::fs::read(dir_a.path().join("logo (A).png")).ok();
        let loser_b = std::fs::read(dir_b.path().join("logo (A).png")).ok();
        winner_a.as_deref() == Some(h2.as_slice())
            && winner_b.as_deref() == Some(h2.as_slice())
            && loser_a.as_deref() == Some(h1.as_slice())
            && loser_b.as_deref() == Some(h1.as_slice())
    })
    .await;
}

#[tokio::test]
async fn deletions_propagate_through_the_index() {
    let (url, _state, _relay_dir) = start_relay().await;
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let _a = start_agent(dir_a.path(), &url, "A");
    let _b = start_agent(dir_b.path(), &url, "B");
    tokio::time::sleep(Duration::from_millis(600)).await;

    std::fs::write(dir_a.path().join("doomed.md"), "temporary").unwrap();
    wait_until(15, || dir_b.path().join("doomed.md").exists()).await;

    std::fs::remove_file(dir_a.path().join("doomed.md")).unwrap();
    wait_until(15, || !dir_b.path().join("doomed.md").exists()).await;
}

#[tokio::test]
async fn history_lost_reseeds_from_server_snapshot() {
    let (url, state, _relay_dir) = start_relay().await;
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let a = start_agent(dir_a.path(), &url, "A");
    let _b = start_agent(dir_b.path(), &url, "B");
    tokio::time::sleep(Duration::from_millis(600)).await;

    std::fs::write(dir_a.path().join("d.md"), "Hello").unwrap();
    wait_until(15, || {
        read_text(&dir_b.path().join("d.md")).as_deref() == Some("Hello")
    })
    .await;

    // A goes away; B keeps editing; the relay compacts the doc. A's state
    // vector now predates the snapshot horizon.
    a.abort();
    tokio::time::sleep(Duration::from_millis(200)).await;

    std::fs::write(dir_b.path().join("d.md"), "Hello World").unwrap();
    wait_until(15, || {
        state
            .store
            .read_state("d.md")
            .map(|m| m.updates.len() >= 2)
            .unwrap_or(false)
    })
    .await;
    compact_doc(&state.store, "d.md").unwrap();

    // A reconnects, is told the history is gone, and re-seeds from the
    // snapshot.
    let _a = start_agent(dir_a.path(), &url, "A");
    wait_until(20, || {
        read_text(&dir_a.path().join("d.md")).as_deref() == Some("Hello World")
    })
    .await;
}
