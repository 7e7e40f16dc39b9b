//! Transfer scheduling against scripted remotes.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use foldsync_engine::{
    EngineConfig, EngineContext, Folder, FolderSettings, MockChannel, SyncNode, TransferEvent,
};
use sync_core::{SyncProfile, TransferProblem};
use sync_types::{
    FileChunk, FileList, FileRecord, FolderId, FolderInfo, FolderList, Identity, Message, NodeId,
    NodeInfo, RequestDownload, TransferFile, PROTOCOL_VERSION,
};
use tempfile::TempDir;
use tokio::sync::broadcast;

const WAIT: Duration = Duration::from_secs(5);

fn shared_folder() -> FolderInfo {
    FolderInfo::new(FolderId::from_key(b"transfers"), "transfers")
}

fn node_with(data_dir: &Path, tune: impl FnOnce(&mut EngineConfig)) -> Arc<SyncNode> {
    let mut config = EngineConfig::default();
    config.node.data_dir = data_dir.to_path_buf();
    config.handshake.folder_list_timeout_secs = 5;
    config.handshake.filelist_idle_timeout_secs = 5;
    config.handshake.ack_timeout_secs = 5;
    tune(&mut config);
    let ctx = EngineContext::new(config, NodeInfo::new(NodeId::random(), "local"));
    SyncNode::new(ctx, None)
}

fn manual_folder(node: &SyncNode, base: &Path) -> Arc<Folder> {
    let mut settings = FolderSettings::new(shared_folder(), base);
    settings.profile = SyncProfile::Manual;
    node.add_folder(settings).unwrap()
}

/// Handshake a scripted remote holding `folders`; `files` is its list for
/// the shared folder.
async fn connect_remote(
    node: &Arc<SyncNode>,
    folders: Vec<FolderInfo>,
    files: Vec<FileRecord>,
    lan: bool,
) -> (MockChannel, NodeId) {
    let identity = Identity {
        node: NodeInfo::new(NodeId::random(), "remote"),
        network_id: node.context().network_id.clone(),
        protocol_version: PROTOCOL_VERSION,
        accepts_incoming: true,
        requires_handshake_ack: true,
    };
    let remote = identity.node.id;
    let channel = MockChannel::new(identity);
    channel.set_lan(lan);
    let shares = !folders.is_empty();
    channel.inject(Message::FolderList(FolderList { folders }));
    if shares {
        channel.inject(Message::FileList(FileList {
            folder: shared_folder().id,
            files,
            following_deltas: 0,
            rejected: false,
        }));
    }
    channel.inject(Message::HandshakeCompleted);

    let member = node.accept(Arc::new(channel.clone())).await.unwrap();
    assert!(member.is_completely_connected());
    channel.clear_sent();
    (channel, remote)
}

async fn wait_until<F: Fn() -> bool>(check: F) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

fn broken(events: &mut broadcast::Receiver<TransferEvent>) -> Vec<TransferProblem> {
    let mut problems = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let TransferEvent::DownloadBroken { problem, .. } = event {
            problems.push(problem);
        }
    }
    problems
}

fn requested_offsets(channel: &MockChannel) -> Vec<u64> {
    channel
        .sent()
        .into_iter()
        .filter_map(|m| match m {
            Message::RequestPart(part) => Some(part.offset),
            _ => None,
        })
        .collect()
}

fn count_sent(channel: &MockChannel, matches: impl Fn(&Message) -> bool) -> usize {
    channel.sent().iter().filter(|m| matches(m)).count()
}

fn chunk(file: &FileRecord, content: &[u8], offset: u64, length: usize) -> FileChunk {
    let start = offset as usize;
    let data = content[start..start + length].to_vec();
    FileChunk {
        file: file.clone(),
        offset,
        checksum: *blake3::hash(&data).as_bytes(),
        data,
    }
}

#[tokio::test]
async fn download_survives_until_last_source_leaves() {
    let data = TempDir::new().unwrap();
    let base = TempDir::new().unwrap();
    let node = node_with(data.path(), |_| {});
    let folder = manual_folder(&node, base.path());
    let info = shared_folder();
    let file = FileRecord::new_file(info.id, "movie.bin", 1_000, 5_000, NodeId::random());

    let (first, r1) = connect_remote(&node, vec![info.clone()], vec![file.clone()], true).await;
    let (second, r2) = connect_remote(&node, vec![info.clone()], vec![file.clone()], true).await;
    assert!(wait_until(|| folder.sources_for(&file).len() == 2).await);

    let mut events = node.context().events.subscribe_transfers();
    let manager = node
        .transfers()
        .download_newest_version(&folder, file.clone(), false)
        .await
        .unwrap();
    assert_eq!(manager.source_count(), 2);
    assert_eq!(count_sent(&first, |m| matches!(m, Message::RequestDownload(_))), 1);
    assert_eq!(count_sent(&second, |m| matches!(m, Message::RequestDownload(_))), 1);

    node.member(&r1).unwrap().disconnect("gone").await;
    let running = node.transfers().download(&file.key()).unwrap();
    assert!(Arc::ptr_eq(&running, &manager));
    assert_eq!(manager.source_count(), 1);
    assert!(!manager.is_done());
    assert!(broken(&mut events).is_empty());

    node.member(&r2).unwrap().disconnect("gone").await;
    assert!(manager.is_done());
    assert!(node.transfers().download(&file.key()).is_none());
    assert_eq!(broken(&mut events), vec![TransferProblem::PartnerDisconnected]);

    // Manual downloads wait for the next source
    let pending = node.transfers().pending_downloads();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].key(), file.key());
}

#[tokio::test]
async fn chunks_refill_requests_and_complete_the_file() {
    let data = TempDir::new().unwrap();
    let base = TempDir::new().unwrap();
    let node = node_with(data.path(), |config| {
        config.transfers.chunk_size = 10;
        config.transfers.max_pending_part_requests = 3;
    });
    let folder = manual_folder(&node, base.path());
    let info = shared_folder();
    let content: Vec<u8> = (0..100u8).collect();
    let file = FileRecord::new_file(info.id, "data.bin", 100, 5_000, NodeId::random());

    let (source, r1) = connect_remote(&node, vec![info.clone()], vec![file.clone()], true).await;
    let (_bystander, r2) = connect_remote(&node, vec![info.clone()], Vec::new(), true).await;
    assert!(wait_until(|| folder.sources_for(&file).len() == 1).await);

    let transfers = node.transfers();
    let manager = transfers
        .download_newest_version(&folder, file.clone(), false)
        .await
        .unwrap();
    transfers
        .on_start_upload(r1, TransferFile::new(file.clone()))
        .await;
    assert_eq!(requested_offsets(&source), vec![0, 10, 20]);

    transfers.on_chunk(r1, chunk(&file, &content, 0, 10)).await;
    assert_eq!(manager.received_bytes(), 10);
    assert_eq!(requested_offsets(&source), vec![0, 10, 20, 30]);

    // Nobody asked for these
    transfers.on_chunk(r1, chunk(&file, &content, 50, 10)).await;
    transfers.on_chunk(r2, chunk(&file, &content, 10, 10)).await;
    assert_eq!(manager.received_bytes(), 10);
    assert_eq!(requested_offsets(&source).len(), 4);
    assert!(!manager.is_done());

    let mut answered: HashSet<u64> = HashSet::from([0]);
    while !manager.is_done() {
        let next = requested_offsets(&source)
            .into_iter()
            .find(|offset| !answered.contains(offset))
            .expect("an outstanding request");
        answered.insert(next);
        transfers.on_chunk(r1, chunk(&file, &content, next, 10)).await;
    }

    assert_eq!(answered.len(), 10);
    assert!(manager.problem().is_none());
    assert_eq!(std::fs::read(base.path().join("data.bin")).unwrap(), content);
    assert!(folder
        .find_local("data.bin")
        .is_some_and(|local| local.is_same_version(&file)));
    assert_eq!(count_sent(&source, |m| matches!(m, Message::StopUpload(_))), 1);
}

#[tokio::test]
async fn unacknowledged_request_breaks_and_is_retried() {
    let data = TempDir::new().unwrap();
    let base = TempDir::new().unwrap();
    let node = node_with(data.path(), |config| {
        config.transfers.queue_ack_timeout_secs = 0;
    });
    let folder = manual_folder(&node, base.path());
    let info = shared_folder();
    let file = FileRecord::new_file(info.id, "slow.bin", 10, 5_000, NodeId::random());
    let (source, _) = connect_remote(&node, vec![info.clone()], vec![file.clone()], true).await;
    assert!(wait_until(|| folder.sources_for(&file).len() == 1).await);

    let mut events = node.context().events.subscribe_transfers();
    let first = node
        .transfers()
        .download_newest_version(&folder, file.clone(), false)
        .await
        .unwrap();
    node.transfers().maintain().await;

    assert_eq!(first.problem(), Some(TransferProblem::NotAcknowledged));
    assert_eq!(broken(&mut events), vec![TransferProblem::NotAcknowledged]);
    assert_eq!(count_sent(&source, |m| matches!(m, Message::AbortDownload(_))), 1);

    // The parked request found its source again in the same pass
    let retry = node.transfers().download(&file.key()).unwrap();
    assert!(!Arc::ptr_eq(&retry, &first));
    assert_eq!(count_sent(&source, |m| matches!(m, Message::RequestDownload(_))), 2);
}

#[tokio::test]
async fn silent_source_times_out_before_first_part() {
    let data = TempDir::new().unwrap();
    let base = TempDir::new().unwrap();
    let node = node_with(data.path(), |config| {
        config.transfers.first_part_timeout_secs = 0;
    });
    let folder = manual_folder(&node, base.path());
    let info = shared_folder();
    let file = FileRecord::new_file(info.id, "quiet.bin", 10, 5_000, NodeId::random());
    let (source, r1) = connect_remote(&node, vec![info.clone()], vec![file.clone()], true).await;
    assert!(wait_until(|| folder.sources_for(&file).len() == 1).await);

    let manager = node
        .transfers()
        .download_newest_version(&folder, file.clone(), true)
        .await
        .unwrap();
    node.transfers()
        .on_start_upload(r1, TransferFile::new(file.clone()))
        .await;
    node.transfers().maintain().await;

    assert_eq!(manager.problem(), Some(TransferProblem::Timeout));
    assert!(source.sent().iter().any(|m| matches!(
        m,
        Message::AbortDownload(abort) if abort.file.key() == file.key()
    )));
    // Automatic downloads are not parked
    assert!(node.transfers().pending_downloads().is_empty());
}

#[tokio::test]
async fn upload_requests_are_validated() {
    let data = TempDir::new().unwrap();
    let base = TempDir::new().unwrap();
    std::fs::write(base.path().join("a.txt"), b"alpha").unwrap();
    let node = node_with(data.path(), |_| {});
    let folder = manual_folder(&node, base.path());
    assert!(folder.scan_local_files(false).await);
    let local = folder.find_local("a.txt").unwrap();
    let info = shared_folder();

    let (member_channel, member) = connect_remote(&node, vec![info.clone()], Vec::new(), true).await;
    let (outsider_channel, outsider) = connect_remote(&node, Vec::new(), Vec::new(), true).await;
    assert!(folder.is_member(&member));
    assert!(!folder.is_member(&outsider));

    let transfers = node.transfers();
    let request = |file: FileRecord| RequestDownload {
        file,
        start_offset: 0,
    };
    let rejection = |channel: &MockChannel| {
        channel.sent().into_iter().find_map(|m| match m {
            Message::AbortUpload(abort) => abort.reason,
            _ => None,
        })
    };

    let index = FileRecord::new_file(info.id, ".foldsync/index.fsi", 10, 1, NodeId::random());
    transfers.queue_upload(member, request(index)).await;
    assert_eq!(rejection(&member_channel).as_deref(), Some("not a transferable file"));
    member_channel.clear_sent();

    transfers.queue_upload(outsider, request(local.clone())).await;
    assert_eq!(rejection(&outsider_channel).as_deref(), Some("not a member of the folder"));
    assert!(transfers.uploads().is_empty());

    transfers.queue_upload(member, request(local.clone())).await;
    let sent = member_channel.sent();
    assert!(sent.iter().any(|m| matches!(
        m,
        Message::DownloadQueued(queued) if queued.file.is_same_version(&local)
    )));
    assert!(sent.iter().any(|m| matches!(m, Message::StartUpload(_))));
    assert!(rejection(&member_channel).is_none());
    assert_eq!(transfers.uploads().len(), 1);
    assert!(transfers.uploads()[0].is_active());
}

#[tokio::test]
async fn changed_file_is_not_served_and_rescanned() {
    let data = TempDir::new().unwrap();
    let base = TempDir::new().unwrap();
    std::fs::write(base.path().join("a.txt"), b"alpha").unwrap();
    let node = node_with(data.path(), |_| {});
    let folder = manual_folder(&node, base.path());
    assert!(folder.scan_local_files(false).await);
    let local = folder.find_local("a.txt").unwrap();
    let (channel, member) =
        connect_remote(&node, vec![shared_folder()], Vec::new(), true).await;

    std::fs::write(base.path().join("a.txt"), b"alpha, edited").unwrap();
    node.transfers()
        .queue_upload(
            member,
            RequestDownload {
                file: local.clone(),
                start_offset: 0,
            },
        )
        .await;

    assert!(channel.sent().iter().any(|m| matches!(
        m,
        Message::AbortUpload(abort) if abort.reason.as_deref() == Some("file changed on disk")
    )));
    assert!(node.transfers().uploads().is_empty());
    assert!(
        wait_until(|| folder
            .find_local("a.txt")
            .is_some_and(|record| record.is_newer_than(&local) && record.size == 13))
        .await
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_wan_requests_share_one_slot() {
    let data = TempDir::new().unwrap();
    let base = TempDir::new().unwrap();
    std::fs::write(base.path().join("a.txt"), b"alpha").unwrap();
    let node = node_with(data.path(), |config| {
        config.transfers.max_uploads = 1;
    });
    let folder = manual_folder(&node, base.path());
    assert!(folder.scan_local_files(false).await);
    let local = folder.find_local("a.txt").unwrap();

    let mut remotes = Vec::new();
    for _ in 0..4 {
        remotes.push(connect_remote(&node, vec![shared_folder()], Vec::new(), false).await);
    }

    let tasks: Vec<_> = remotes
        .iter()
        .map(|(_, remote)| {
            let transfers = Arc::clone(node.transfers());
            let request = RequestDownload {
                file: local.clone(),
                start_offset: 0,
            };
            let remote = *remote;
            tokio::spawn(async move { transfers.queue_upload(remote, request).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    let active: Vec<NodeId> = node
        .transfers()
        .uploads()
        .iter()
        .filter(|u| u.is_active())
        .map(|u| u.partner())
        .collect();
    assert_eq!(active.len(), 1);
    assert_eq!(node.transfers().status().queued_uploads, 3);
    let started: usize = remotes
        .iter()
        .map(|(channel, _)| count_sent(channel, |m| matches!(m, Message::StartUpload(_))))
        .sum();
    assert_eq!(started, 1);

    // The freed slot goes to a waiting partner
    node.member(&active[0]).unwrap().disconnect("gone").await;
    let next: Vec<NodeId> = node
        .transfers()
        .uploads()
        .iter()
        .filter(|u| u.is_active())
        .map(|u| u.partner())
        .collect();
    assert_eq!(next.len(), 1);
    assert_ne!(next[0], active[0]);
}
