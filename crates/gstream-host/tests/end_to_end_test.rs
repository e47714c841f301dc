//! Integration test: guest encoder against the host decoder over a real
//! transport.
//!
//! Each harness wires a guest session to a decoder through an in-process
//! ASG channel pair, with the handshake and frame loop both live. The host
//! runs the software driver, so memory traffic moves actual bytes.
//!
//! Run with: cargo test --test end_to_end_test -- --nocapture

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use gstream_common::AddressSpaceWindow;
use gstream_core::config::MemoryConfig;
use gstream_guest::{Encoder, GuestError, GuestSession};
use gstream_host::testing::TestDriver;
use gstream_host::Decoder;
use gstream_protocol::commands::{vk_result, NativeBufferInfo, SubmitInfo, VkCommand, VkResponse};
use gstream_protocol::features::SessionFeatures;
use gstream_protocol::handle::BoxedHandle;
use gstream_protocol::wire;
use gstream_transport::frame::read_frame;
use gstream_transport::handshake::{guest_connect, host_accept};
use gstream_transport::{asg_channel_pair_with_capacity, Channel, TransportError};

const PUID: u64 = 42;
const CHANNEL_CAPACITY: usize = 1 << 20;

struct Harness {
    encoder: Encoder,
    decoder: Arc<Decoder>,
    driver: Arc<TestDriver>,
    host: thread::JoinHandle<Result<(), TransportError>>,
}

fn connect(with_window: bool) -> Harness {
    gstream_common::logging::init_logging();
    let window = with_window.then(|| Arc::new(AddressSpaceWindow::new(4 << 20)));
    let driver = Arc::new(TestDriver::with_window(window.clone()));
    let decoder = Arc::new(Decoder::new(
        PUID,
        Arc::clone(&driver) as Arc<dyn gstream_host::HostDriver>,
        window.clone(),
    ));

    let (guest_chan, mut host_chan) = asg_channel_pair_with_capacity(CHANNEL_CAPACITY);
    let host = {
        let decoder = Arc::clone(&decoder);
        thread::spawn(move || {
            let session = host_accept(&mut host_chan, SessionFeatures::all(), PUID)?;
            decoder.serve(&mut host_chan, &session)
        })
    };

    let session = GuestSession::connect(Box::new(guest_chan), SessionFeatures::all())
        .expect("handshake failed");
    let config = MemoryConfig {
        virtual_host_visible_heap_size: 1 << 20,
        in_flight_frames: 3,
    };
    let encoder = Encoder::new(Arc::new(session), window, &config);

    Harness {
        encoder,
        decoder,
        driver,
        host,
    }
}

impl Harness {
    /// Bring up instance, device and queue 0, and prime the memory type
    /// translation.
    fn bootstrap(&self) -> (BoxedHandle, BoxedHandle, BoxedHandle) {
        let enc = &self.encoder;
        let instance = enc
            .create_instance(Some("end-to-end"), 0x40_0000, &[])
            .expect("create instance");
        let pds = enc
            .enumerate_physical_devices(instance)
            .expect("enumerate physical devices");
        assert!(!pds.is_empty(), "no physical devices");
        let props = enc.get_memory_properties(pds[0]).expect("memory properties");
        // Host-visible types must read as coherent on the guest side.
        assert!(props.memory_types[1].property_flags & 0x4 != 0);
        let device = enc
            .create_device(pds[0], 0, 2, &[])
            .expect("create device");
        let queue = enc.get_device_queue(device, 0, 0).expect("get queue 0");
        (instance, device, queue)
    }

    fn finish(self) {
        drop(self.encoder);
        match self.host.join().expect("host thread panicked") {
            Ok(()) => {}
            Err(err) => panic!("host stream failed: {err}"),
        }
    }
}

#[test]
fn full_lifecycle_over_the_wire() {
    let harness = connect(true);
    let (instance, device, queue0) = harness.bootstrap();
    let enc = &harness.encoder;

    let queue1 = enc.get_device_queue(device, 0, 1).expect("get queue 1");
    assert_ne!(queue0, queue1, "virtual queues must be distinct handles");

    let buffer = enc.create_buffer(device, 4096, 1).expect("create buffer");
    let reqs = enc
        .get_buffer_memory_requirements(device, buffer)
        .expect("buffer requirements");
    assert_eq!(reqs.memory_type_bits, 0b11);

    let memory = enc.allocate_memory(device, 4096, 1).expect("allocate");
    enc.bind_buffer_memory(device, buffer, memory, 0).expect("bind");

    let pool = enc.create_command_pool(device, 0).expect("command pool");
    let cbs = enc
        .allocate_command_buffers(device, pool, 1)
        .expect("command buffers");
    assert_eq!(cbs.len(), 1);

    let fence = enc.create_fence(device, false).expect("create fence");
    let submit = SubmitInfo {
        command_buffers: vec![cbs[0]],
        ..SubmitInfo::default()
    };
    enc.queue_submit(queue0, vec![submit.clone()], fence)
        .expect("submit on queue 0");
    let waited = enc
        .wait_for_fences(device, &[fence], true, 1_000_000_000)
        .expect("wait for fence");
    assert_eq!(waited, vk_result::SUCCESS);

    enc.queue_submit(queue1, vec![submit], 0)
        .expect("submit on queue 1");

    // Both virtual queues funnel into the same physical queue. The driver
    // logs native handles, so the same unboxed command buffer shows up in
    // both submits.
    let log = harness.driver.submit_log();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].queue, log[1].queue);
    assert_eq!(log[0].command_buffers.len(), 1);
    assert_eq!(log[0].command_buffers, log[1].command_buffers);
    assert_ne!(log[0].command_buffers[0], cbs[0]);

    enc.destroy_fence(device, fence).expect("destroy fence");
    enc.free_command_buffers(device, pool, &cbs).expect("free cbs");
    enc.destroy_command_pool(device, pool).expect("destroy pool");
    enc.destroy_buffer(device, buffer).expect("destroy buffer");
    enc.free_memory(memory).expect("free memory");
    enc.destroy_device(device).expect("destroy device");
    enc.destroy_instance(instance).expect("destroy instance");

    harness.finish();
}

#[test]
fn host_visible_memory_is_suballocated_and_reused() {
    let harness = connect(true);
    let (_, device, _) = harness.bootstrap();
    let enc = &harness.encoder;

    let m1 = enc.allocate_memory(device, 4096, 1).expect("allocate m1");
    let m2 = enc.allocate_memory(device, 4096, 1).expect("allocate m2");
    let p1 = enc.map_memory(m1, 0).expect("map m1");
    let p2 = enc.map_memory(m2, 0).expect("map m2");

    // Both come out of one heap block, laid out back to back.
    assert_eq!(p2 as usize - p1 as usize, 4096);

    unsafe { std::slice::from_raw_parts_mut(p1, 8).fill(0x7E) };

    enc.free_memory(m1).expect("free m1");
    let m3 = enc.allocate_memory(device, 4096, 1).expect("allocate m3");
    let p3 = enc.map_memory(m3, 0).expect("map m3");
    // Freed range is handed back out, lowest offset first.
    assert_eq!(p3, p1);

    harness.finish();
}

#[test]
fn shadow_memory_round_trips_on_flush_and_invalidate() {
    // No window: host-visible memory falls back to shadow buffers.
    let harness = connect(false);
    let (_, device, _) = harness.bootstrap();
    let enc = &harness.encoder;

    let memory = enc.allocate_memory(device, 1024, 1).expect("allocate");
    let ptr = enc.map_memory(memory, 0).expect("map");

    let mapped = unsafe { std::slice::from_raw_parts_mut(ptr, 16) };
    mapped.fill(0x5A);
    enc.flush_mapped_ranges(device, &[(memory, 0, 16)])
        .expect("flush");

    // Clobber the local copy, then pull the host's bytes back.
    mapped.fill(0);
    enc.invalidate_mapped_ranges(device, &[(memory, 0, 16)])
        .expect("invalidate");
    assert_eq!(unsafe { std::slice::from_raw_parts(ptr, 16) }, [0x5A; 16]);

    harness.finish();
}

#[test]
fn snapshot_restore_preserves_handles_and_memory() {
    let harness = connect(true);
    let (_, device, _) = harness.bootstrap();
    let enc = &harness.encoder;

    let memory = enc.allocate_memory(device, 4096, 1).expect("allocate");
    let ptr = enc.map_memory(memory, 0).expect("map");
    unsafe { std::slice::from_raw_parts_mut(ptr, 4096).fill(0xFF) };

    // The RPCs above are synchronous, so the host is quiesced here.
    let snapshot = harness.decoder.snapshot(None).expect("snapshot");
    let live = harness.decoder.registry().live_count();
    assert!(snapshot
        .memory
        .iter()
        .any(|image| image.bytes[..4096].iter().all(|&b| b == 0xFF)));

    let window2 = Arc::new(AddressSpaceWindow::new(4 << 20));
    let driver2 = Arc::new(TestDriver::with_window(Some(Arc::clone(&window2))));
    let restored = Decoder::restore(
        &snapshot,
        driver2 as Arc<dyn gstream_host::HostDriver>,
        Some(Arc::clone(&window2)),
    )
    .expect("restore");

    assert_eq!(restored.registry().live_count(), live);
    // The heap block replays into the same window placement, with its
    // bytes intact.
    let mut out = [0u8; 4096];
    unsafe { window2.read_at(0, &mut out) };
    assert_eq!(out, [0xFF; 4096]);

    harness.finish();
}

#[test]
fn commands_on_one_device_serialize_across_channels() {
    let window: Option<Arc<AddressSpaceWindow>> = None;
    let driver = Arc::new(TestDriver::new());
    let decoder = Arc::new(Decoder::new(
        PUID,
        driver as Arc<dyn gstream_host::HostDriver>,
        window,
    ));

    let mut hosts = Vec::new();
    let mut sessions = Vec::new();
    for _ in 0..2 {
        let (guest_chan, mut host_chan) = asg_channel_pair_with_capacity(CHANNEL_CAPACITY);
        let decoder = Arc::clone(&decoder);
        hosts.push(thread::spawn(move || {
            let session = host_accept(&mut host_chan, SessionFeatures::all(), PUID)?;
            decoder.serve(&mut host_chan, &session)
        }));
        sessions.push(Arc::new(
            GuestSession::connect(Box::new(guest_chan), SessionFeatures::all())
                .expect("handshake failed"),
        ));
    }

    let instance = match sessions[0]
        .call(
            &VkCommand::CreateInstance {
                app_name: None,
                api_version: 0x40_0000,
                enabled_extensions: vec![],
            },
            0,
        )
        .expect("create instance")
    {
        VkResponse::Handle { handle } => handle,
        other => panic!("expected Handle, got {:?}", other),
    };
    let pd = match sessions[0]
        .call(&VkCommand::EnumeratePhysicalDevices { instance }, 0)
        .expect("enumerate")
    {
        VkResponse::Handles { handles } => handles[0],
        other => panic!("expected Handles, got {:?}", other),
    };
    let device = match sessions[0]
        .call(
            &VkCommand::CreateDevice {
                physical_device: pd,
                queue_family_index: 0,
                queue_count: 1,
                enabled_extensions: vec![],
            },
            0,
        )
        .expect("create device")
    {
        VkResponse::Handle { handle } => handle,
        other => panic!("expected Handle, got {:?}", other),
    };

    // Sequence 2 arrives on the second channel first; the host must park it
    // until sequence 1 lands on the first channel.
    let late_done = Arc::new(AtomicBool::new(false));
    let late = {
        let session = Arc::clone(&sessions[1]);
        let done = Arc::clone(&late_done);
        thread::spawn(move || {
            let resp = session
                .call(
                    &VkCommand::CreateBuffer {
                        device,
                        size: 64,
                        usage: 0,
                    },
                    2,
                )
                .expect("late create buffer");
            done.store(true, Ordering::SeqCst);
            resp
        })
    };

    thread::sleep(Duration::from_millis(100));
    assert!(
        !late_done.load(Ordering::SeqCst),
        "sequence 2 ran before sequence 1"
    );

    match sessions[0]
        .call(
            &VkCommand::CreateBuffer {
                device,
                size: 64,
                usage: 0,
            },
            1,
        )
        .expect("create buffer")
    {
        VkResponse::Handle { .. } => {}
        other => panic!("expected Handle, got {:?}", other),
    }

    match late.join().expect("late thread panicked") {
        VkResponse::Handle { .. } => {}
        other => panic!("expected Handle, got {:?}", other),
    }
    assert!(late_done.load(Ordering::SeqCst));

    for session in &sessions {
        session.shutdown();
    }
    drop(sessions);
    for host in hosts {
        match host.join().expect("host thread panicked") {
            Ok(()) => {}
            Err(err) => panic!("host stream failed: {err}"),
        }
    }
}

#[cfg(unix)]
#[test]
fn native_buffer_bind_and_release_fence() {
    use gstream_common::sync_fd::DEFAULT_SYNC_WAIT;

    let harness = connect(true);
    let (_, device, queue) = harness.bootstrap();
    let enc = &harness.encoder;

    let image = enc
        .create_image(device, 64, 64, 37, 1)
        .expect("create image");
    enc.bind_image_memory2(
        device,
        image,
        None,
        0,
        Some(NativeBufferInfo {
            native_handle: 0xCAFE,
            stride: 256,
            format: 37,
        }),
    )
    .expect("bind native buffer");

    let fence = enc.acquire_pooled_fence(device).expect("pooled fence");
    let semaphore = enc.create_semaphore(device).expect("semaphore");
    enc.acquire_image(queue, image, fence, semaphore)
        .expect("acquire image");
    let waited = enc
        .wait_for_fences(device, &[fence], true, 1_000_000_000)
        .expect("wait for acquire fence");
    assert_eq!(waited, vk_result::SUCCESS);

    let sync = enc
        .queue_signal_release_image(queue, image)
        .expect("release fence fd");
    assert_eq!(sync.wait(DEFAULT_SYNC_WAIT).expect("sync wait"), 0);

    enc.release_pooled_fence(device, fence).expect("return fence");

    harness.finish();
}

#[test]
fn pooled_fences_stay_with_their_device() {
    let harness = connect(false);
    let (instance, device_a, _) = harness.bootstrap();
    let enc = &harness.encoder;

    let pds = enc
        .enumerate_physical_devices(instance)
        .expect("enumerate physical devices");
    let device_b = enc.create_device(pds[0], 0, 1, &[]).expect("create device b");

    let fence = enc.acquire_pooled_fence(device_a).expect("fence on a");
    enc.release_pooled_fence(device_a, fence)
        .expect("return to a's pool");

    // Device B's pool starts empty; it must not be handed A's fence.
    let other = enc.acquire_pooled_fence(device_b).expect("fence on b");
    assert_ne!(other, fence, "pooled fence crossed devices");
    enc.release_pooled_fence(device_b, other)
        .expect("return to b's pool");

    // Tearing down a device takes its pooled fences with it, without
    // touching the other pool.
    enc.destroy_device(device_a).expect("destroy device a");
    assert!(enc.handles().tag(fence).is_none());
    let again = enc.acquire_pooled_fence(device_b).expect("reacquire on b");
    assert_eq!(again, other);

    harness.finish();
}

#[test]
fn corrupted_frame_kills_the_stream() {
    let driver = Arc::new(TestDriver::new());
    let decoder = Arc::new(Decoder::new(
        PUID,
        driver as Arc<dyn gstream_host::HostDriver>,
        None,
    ));

    let (mut guest_chan, mut host_chan) = asg_channel_pair_with_capacity(CHANNEL_CAPACITY);
    let host = {
        let decoder = Arc::clone(&decoder);
        thread::spawn(move || {
            let session = host_accept(&mut host_chan, SessionFeatures::all(), PUID)?;
            decoder.serve(&mut host_chan, &session)
        })
    };

    let info = guest_connect(&mut guest_chan, SessionFeatures::all()).expect("handshake");

    // Flip a trailer byte so the host's checksum verification fails.
    let mut raw = wire::encode_frame(0x100, 1, b"", info.checksum);
    let last = raw.len() - 1;
    raw[last] ^= 0xFF;
    guest_chan.write_bytes(&raw).expect("write");
    guest_chan.flush().expect("flush");

    // The host answers with end-of-stream and tears the session down.
    let frame = read_frame(&mut guest_chan, info.checksum).expect("read reply");
    assert!(frame.is_eos(), "expected EOS, got {:?}", frame.header);

    match host.join().expect("host thread panicked") {
        Err(TransportError::Wire(
            gstream_protocol::wire::WireError::ChecksumMismatch { .. },
        )) => {}
        other => panic!("expected checksum mismatch, got {:?}", other),
    }
}

#[test]
fn calls_after_shutdown_report_device_lost() {
    let harness = connect(false);
    let (instance, _, _) = harness.bootstrap();
    let enc = &harness.encoder;

    enc.session().shutdown();

    match enc.destroy_instance(instance) {
        Err(GuestError::DeviceLost) => {}
        other => panic!("expected DeviceLost, got {:?}", other),
    }

    match harness.host.join().expect("host thread panicked") {
        Ok(()) => {}
        Err(err) => panic!("host stream failed: {err}"),
    }
}
