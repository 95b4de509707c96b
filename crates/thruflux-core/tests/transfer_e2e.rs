//! End-to-end transfer scenarios over a real quiche connection pair.
//!
//! Both endpoints run against an in-memory lossless datagram link, so runs
//! are deterministic: no sockets, no sleeps. Resume scenarios seed the
//! receiver's output directory and cursor exactly as an aborted run would
//! have left them.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use proptest::prelude::*;

use thruflux_core::constants::MANIFEST_STREAM_TAG;
use thruflux_core::manifest::SourceIndex;
use thruflux_core::metrics::PathClass;
use thruflux_core::resume::state_path;
use thruflux_core::transfer::{ReceiverPipeline, SenderPipeline};
use thruflux_core::transport::cert::generate_self_signed_cert;
use thruflux_core::transport::config::{client_config, server_config};
use thruflux_core::transport::{StreamIo, TransferHandler};
use thruflux_core::{ConnectionDriver, Result, TransferConfig, TransportTuning};
use thruflux_test_utils::{fill, read_tree, run_to_completion, write_file, QueuePacketSink};

const MIB: usize = 1024 * 1024;
const MAX_ROUNDS: usize = 10_000;

fn addrs() -> (SocketAddr, SocketAddr) {
    ("127.0.0.1:9001".parse().unwrap(), "127.0.0.1:9002".parse().unwrap())
}

/// Big datagrams keep in-memory runs short; the wire format is unchanged.
fn big_datagrams(mut tuning: TransportTuning) -> TransportTuning {
    tuning.max_send_udp_payload = 65527;
    tuning
}

fn endpoints(
    inputs: &[PathBuf],
    out_dir: &Path,
    overwrite: bool,
) -> (
    ConnectionDriver<SenderPipeline>,
    ConnectionDriver<ReceiverPipeline>,
) {
    let (client_addr, server_addr) = addrs();
    let (cert, key) = generate_self_signed_cert().unwrap();
    let mut client_cfg = client_config(&big_datagrams(TransportTuning::sender())).unwrap();
    let mut server_cfg =
        server_config(&big_datagrams(TransportTuning::receiver()), &cert, &key).unwrap();

    let source = Arc::new(SourceIndex::scan(inputs).unwrap());
    let sender = SenderPipeline::new(
        source,
        &TransferConfig::default(),
        PathClass::Direct,
        "receiver-1",
    );
    let receiver = ReceiverPipeline::new(
        TransferConfig::default()
            .with_output_dir(out_dir)
            .with_overwrite(overwrite),
        PathClass::Direct,
    );

    let sender_driver =
        ConnectionDriver::connect(client_addr, server_addr, &mut client_cfg, sender).unwrap();
    let receiver_driver =
        ConnectionDriver::accept(server_addr, client_addr, &mut server_cfg, receiver).unwrap();
    (sender_driver, receiver_driver)
}

/// Run one session to completion, returning both pipelines for inspection.
fn transfer(
    inputs: &[PathBuf],
    out_dir: &Path,
    overwrite: bool,
) -> (SenderPipeline, ReceiverPipeline) {
    let (mut sender, mut receiver) = endpoints(inputs, out_dir, overwrite);
    run_to_completion(&mut sender, &mut receiver, MAX_ROUNDS).unwrap();
    assert!(sender.is_complete());
    assert!(receiver.is_complete());
    (sender.into_handler(), receiver.into_handler())
}

/// Output tree without the resume state dotfile.
fn visible_tree(root: &Path) -> std::collections::BTreeMap<String, Vec<u8>> {
    read_tree(root)
        .into_iter()
        .filter(|(path, _)| !path.starts_with(".thruflux_resume_"))
        .collect()
}

fn write_resume_state(out_dir: &Path, fingerprint: u64, file_id: u32, offset: u64) {
    let mut raw = Vec::new();
    raw.extend_from_slice(&file_id.to_le_bytes());
    raw.extend_from_slice(&offset.to_le_bytes());
    std::fs::write(state_path(out_dir, fingerprint), raw).unwrap();
}

/// S2's input tree: dir/a.bin (1 MiB of 0xAA) and dir/sub/b.bin (3 MiB of
/// 0x55). Returns the scan input paths.
fn nested_tree(src_root: &Path) -> Vec<PathBuf> {
    write_file(src_root, "dir/a.bin", &fill(0xAA, MIB));
    write_file(src_root, "dir/sub/b.bin", &fill(0x55, 3 * MIB));
    vec![src_root.join("dir")]
}

/// Seed the output directory as an abort after exactly `k` logical bytes of
/// the nested tree would have left it: a durable prefix plus the matching
/// resume cursor.
fn seed_nested_prefix(out_dir: &Path, fingerprint: u64, k: usize) {
    if k <= MIB {
        write_file(out_dir, "dir/a.bin", &fill(0xAA, k));
        write_resume_state(out_dir, fingerprint, 0, k as u64);
    } else {
        write_file(out_dir, "dir/a.bin", &fill(0xAA, MIB));
        write_file(out_dir, "dir/sub/b.bin", &fill(0x55, k - MIB));
        write_resume_state(out_dir, fingerprint, 1, (k - MIB) as u64);
    }
}

// =============================================================================
// Scenarios
// =============================================================================

#[test]
fn s1_single_small_file() {
    let src = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    write_file(src.path(), "hello.txt", b"Hello, world!");

    let (sender, receiver) = transfer(&[src.path().join("hello.txt")], out.path(), false);

    assert_eq!(
        std::fs::read(out.path().join("hello.txt")).unwrap(),
        b"Hello, world!"
    );
    assert_eq!(receiver.metrics().files_moved, 1);
    assert_eq!(receiver.metrics().bytes_moved, 13);
    assert_eq!(sender.metrics().files_moved, 1);
    assert_eq!(sender.metrics().bytes_moved, 13);
}

#[test]
fn s2_nested_tree() {
    let src = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let inputs = nested_tree(src.path());

    let (sender, receiver) = transfer(&inputs, out.path(), false);

    assert_eq!(visible_tree(out.path()), visible_tree(src.path()));
    assert_eq!(receiver.metrics().files_moved, 2);
    assert_eq!(receiver.metrics().bytes_moved, 4 * MIB as u64);
    assert_eq!(sender.metrics().bytes_moved, 4 * MIB as u64);
}

#[test]
fn s3_resume_mid_file() {
    let src = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let inputs = nested_tree(src.path());

    let fingerprint = SourceIndex::scan(&inputs).unwrap().fingerprint();
    let k = 2 * MIB + 7;
    seed_nested_prefix(out.path(), fingerprint, k);

    let (sender, receiver) = transfer(&inputs, out.path(), false);

    assert_eq!(visible_tree(out.path()), visible_tree(src.path()));
    // Only the unsent suffix crossed the wire
    let wire = sender.metrics().bytes_moved - sender.metrics().skipped_bytes;
    assert_eq!(wire, (2 * MIB - 7) as u64);
    assert_eq!(receiver.metrics().skipped_bytes, k as u64);
    assert_eq!(receiver.metrics().bytes_moved, 4 * MIB as u64);
}

#[test]
fn s4_resume_after_full_completion() {
    let src = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    write_file(src.path(), "hello.txt", b"Hello, world!");
    let inputs = vec![src.path().join("hello.txt")];

    transfer(&inputs, out.path(), false);

    // Second run against the retained terminal cursor: no data bytes move
    let (sender, receiver) = transfer(&inputs, out.path(), false);
    assert_eq!(sender.metrics().bytes_moved, sender.metrics().skipped_bytes);
    assert_eq!(receiver.metrics().skipped_bytes, 13);
    assert_eq!(
        std::fs::read(out.path().join("hello.txt")).unwrap(),
        b"Hello, world!"
    );
}

#[test]
fn s5_overwrite_flag_retransfers_everything() {
    let src = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let inputs = nested_tree(src.path());

    let fingerprint = SourceIndex::scan(&inputs).unwrap().fingerprint();
    seed_nested_prefix(out.path(), fingerprint, 2 * MIB + 7);

    let (sender, receiver) = transfer(&inputs, out.path(), true);

    assert_eq!(visible_tree(out.path()), visible_tree(src.path()));
    assert_eq!(sender.metrics().skipped_bytes, 0);
    assert_eq!(sender.metrics().bytes_moved, 4 * MIB as u64);
    assert_eq!(receiver.metrics().skipped_bytes, 0);
}

#[test]
fn s6_zero_byte_file() {
    let src = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    write_file(src.path(), "empty.txt", b"");

    let (sender, receiver) = transfer(&[src.path().join("empty.txt")], out.path(), false);

    let meta = std::fs::metadata(out.path().join("empty.txt")).unwrap();
    assert_eq!(meta.len(), 0);
    assert_eq!(receiver.metrics().bytes_moved, 0);
    assert_eq!(receiver.metrics().files_moved, 1);
    assert_eq!(sender.metrics().bytes_moved, 0);
}

// =============================================================================
// Properties
// =============================================================================

/// Resume idempotence at the boundary cases: k pinned to file edges, chunk
/// interiors, and both ends of the sequence. The randomized sweep below
/// quantifies over arbitrary k.
#[test]
fn resume_is_idempotent_across_prefixes() {
    let src = tempfile::tempdir().unwrap();
    let inputs = nested_tree(src.path());
    let total = 4 * MIB;
    let fingerprint = SourceIndex::scan(&inputs).unwrap().fingerprint();
    let expected = visible_tree(src.path());

    for k in [
        0,
        1,
        512 * 1024,
        MIB - 1,
        MIB,
        MIB + 1,
        2 * MIB + 7,
        total - 1,
        total,
    ] {
        let out = tempfile::tempdir().unwrap();
        seed_nested_prefix(out.path(), fingerprint, k);

        let (sender, receiver) = transfer(&inputs, out.path(), false);

        assert_eq!(visible_tree(out.path()), expected, "k = {k}");
        let wire = sender.metrics().bytes_moved - sender.metrics().skipped_bytes;
        assert_eq!(wire, (total - k) as u64, "k = {k}");
        assert_eq!(receiver.metrics().bytes_moved, total as u64, "k = {k}");
    }
}

/// A genuinely interrupted session leaves state a rerun completes from:
/// whatever the cursor missed is simply transferred again.
#[test]
fn abort_and_restart_produces_identical_tree() {
    let src = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let inputs = nested_tree(src.path());

    // First session is cut off mid-flight by the round cap. Depending on
    // congestion-window growth it may get anywhere from none to most of
    // the data through; the rerun must not care.
    let (mut sender, mut receiver) = endpoints(&inputs, out.path(), false);
    let _ = run_to_completion(&mut sender, &mut receiver, 8);
    drop(sender);
    drop(receiver);

    // Fresh session against the same output directory finishes the job.
    let (_, receiver) = transfer(&inputs, out.path(), false);
    assert_eq!(visible_tree(out.path()), visible_tree(src.path()));
    assert_eq!(receiver.metrics().bytes_moved, 4 * MIB as u64);
}

/// Input tree for the randomized resume sweep, small enough that dozens of
/// full sessions stay quick. Id order: t/a.bin (0), t/c.bin (1),
/// t/empty.bin (2).
fn small_tree(src_root: &Path) -> Vec<PathBuf> {
    write_file(src_root, "t/a.bin", &fill(0xAA, SMALL_A));
    write_file(src_root, "t/c.bin", &fill(0x55, SMALL_TOTAL - SMALL_A));
    write_file(src_root, "t/empty.bin", &[]);
    vec![src_root.join("t")]
}

const SMALL_A: usize = 64 * 1024;
const SMALL_TOTAL: usize = 256 * 1024;

fn seed_small_prefix(out_dir: &Path, fingerprint: u64, k: usize) {
    if k <= SMALL_A {
        write_file(out_dir, "t/a.bin", &fill(0xAA, k));
        write_resume_state(out_dir, fingerprint, 0, k as u64);
    } else {
        write_file(out_dir, "t/a.bin", &fill(0xAA, SMALL_A));
        write_file(out_dir, "t/c.bin", &fill(0x55, k - SMALL_A));
        write_resume_state(out_dir, fingerprint, 1, (k - SMALL_A) as u64);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Aborting after any number of logical bytes and resuming produces
    /// the identical final tree, with exactly the unsent suffix crossing
    /// the wire.
    #[test]
    fn resume_idempotence_holds_for_any_prefix(k in 0usize..=SMALL_TOTAL) {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let inputs = small_tree(src.path());
        let fingerprint = SourceIndex::scan(&inputs).unwrap().fingerprint();
        seed_small_prefix(out.path(), fingerprint, k);

        let (sender, receiver) = transfer(&inputs, out.path(), false);

        prop_assert_eq!(visible_tree(out.path()), visible_tree(src.path()));
        let wire = sender.metrics().bytes_moved - sender.metrics().skipped_bytes;
        prop_assert_eq!(wire, (SMALL_TOTAL - k) as u64);
        prop_assert_eq!(receiver.metrics().bytes_moved, SMALL_TOTAL as u64);
    }
}

/// Peer that sends a syntactically well-formed manifest whose one record
/// escapes the output root.
#[derive(Default)]
struct HostileSender {
    sent: bool,
}

impl TransferHandler for HostileSender {
    fn on_connected(&mut self, io: &mut dyn StreamIo) -> Result<()> {
        let sid = io.open_stream()?;
        let path = b"../escape.bin";
        let mut framed = vec![MANIFEST_STREAM_TAG];
        framed.extend_from_slice(&1u32.to_le_bytes());
        framed.extend_from_slice(&0u32.to_le_bytes());
        framed.extend_from_slice(&4u64.to_le_bytes());
        framed.extend_from_slice(&(path.len() as u16).to_le_bytes());
        framed.extend_from_slice(path);
        io.stream_send(sid, &framed, true)?;
        self.sent = true;
        Ok(())
    }

    fn on_new_stream(&mut self, _io: &mut dyn StreamIo, _stream_id: u64) -> Result<()> {
        Ok(())
    }

    fn on_readable(&mut self, _io: &mut dyn StreamIo, _stream_id: u64) -> Result<()> {
        Ok(())
    }

    fn on_writable(&mut self, _io: &mut dyn StreamIo, _stream_id: u64) -> Result<()> {
        Ok(())
    }

    fn on_tick(&mut self, _io: &mut dyn StreamIo, _now: Instant) -> Result<()> {
        Ok(())
    }

    fn on_conn_closed(&mut self) {}

    fn is_complete(&self) -> bool {
        false
    }
}

/// Path safety end to end: a traversal path inside an otherwise valid
/// manifest makes the receiver close the connection, and no file is
/// created anywhere — inside or outside the output root.
#[test]
fn traversal_manifest_is_rejected_end_to_end() {
    let out = tempfile::tempdir().unwrap();
    let (client_addr, server_addr) = addrs();
    let (cert, key) = generate_self_signed_cert().unwrap();
    let mut client_cfg = client_config(&big_datagrams(TransportTuning::sender())).unwrap();
    let mut server_cfg =
        server_config(&big_datagrams(TransportTuning::receiver()), &cert, &key).unwrap();

    let pipeline = ReceiverPipeline::new(
        TransferConfig::default().with_output_dir(out.path()),
        PathClass::Direct,
    );
    let mut sender =
        ConnectionDriver::connect(client_addr, server_addr, &mut client_cfg, HostileSender::default())
            .unwrap();
    let mut receiver =
        ConnectionDriver::accept(server_addr, client_addr, &mut server_cfg, pipeline).unwrap();

    let mut sender_sink = QueuePacketSink::new();
    let mut receiver_sink = QueuePacketSink::new();
    for _ in 0..64 {
        sender.process(&mut sender_sink).unwrap();
        while let Some(mut packet) = sender_sink.packets.pop_front() {
            if !receiver.is_closed() {
                receiver.recv_datagram(&mut packet, client_addr).unwrap();
            }
        }
        receiver.process(&mut receiver_sink).unwrap();
        while let Some(mut packet) = receiver_sink.packets.pop_front() {
            if !sender.is_closed() {
                sender.recv_datagram(&mut packet, server_addr).unwrap();
            }
        }
        if sender.peer_error().is_some() {
            break;
        }
    }

    assert!(sender.handler().sent, "hostile manifest left the sender");
    let close = sender.peer_error().expect("receiver closed the connection");
    assert!(close.is_app);
    assert!(!receiver.is_complete());
    assert!(receiver.handler().manifest().is_none());
    // Nothing was created: no output files, no resume state, no escape
    assert!(std::fs::read_dir(out.path()).unwrap().next().is_none());
    assert!(!out.path().parent().unwrap().join("escape.bin").exists());
}

/// The terminal cursor survives completion, so the state file names the
/// manifest that produced it.
#[test]
fn terminal_cursor_is_retained() {
    let src = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    write_file(src.path(), "hello.txt", b"Hello, world!");
    let inputs = vec![src.path().join("hello.txt")];

    transfer(&inputs, out.path(), false);

    let fingerprint = SourceIndex::scan(&inputs).unwrap().fingerprint();
    let raw = std::fs::read(state_path(out.path(), fingerprint)).unwrap();
    assert_eq!(u32::from_le_bytes(raw[..4].try_into().unwrap()), 1);
    assert_eq!(u64::from_le_bytes(raw[4..].try_into().unwrap()), 0);
}
