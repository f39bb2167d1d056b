//! Capture and replay on the recording device.

mod common;

use common::*;
use lumen_core::{DataType, Graph, ValueKind};
use lumen_runtime::{
    Backend, BackendConfig, BufferId, BufferOwner, BufferUsage, CaptureStatus, GpuDevice,
    RecordingDevice, RuntimeError, Tensor,
};

#[pollster::test]
async fn test_replay_matches_the_captured_run() {
    let (device, mut backend) = recording_backend(BackendConfig::default());
    let session = load(&mut backend, chain_graph());
    let x = f32s(&[1.0, 2.0, 3.0], &[3]);

    backend.begin_capture(session).unwrap();
    assert_eq!(backend.capture_status(session).unwrap(), CaptureStatus::Recording);
    let captured = backend.run(session, &[("x", x.clone())], &["y"]).await.unwrap();
    backend.end_capture(session).unwrap();
    assert_eq!(backend.capture_status(session).unwrap(), CaptureStatus::Frozen);

    let before = device.counters();
    let replayed = backend.replay(session, &[("x", x)]).await.unwrap();
    let after = device.counters();

    assert_eq!(
        replayed["y"].as_bytes().unwrap(),
        captured["y"].as_bytes().unwrap()
    );
    assert_eq!(after.buffers_created, before.buffers_created);
    assert_eq!(after.pipelines_created, before.pipelines_created);
    assert_eq!(after.dispatches, before.dispatches + 2);
    // Only the input upload; uniform blocks are replayed as captured
    assert_eq!(after.writes, before.writes + 1);
}

#[pollster::test]
async fn test_replay_with_new_inputs_matches_a_normal_run() {
    let (_, mut backend) = recording_backend(BackendConfig::default());
    let captured = load(&mut backend, chain_graph());
    let reference = load(&mut backend, chain_graph());

    backend.begin_capture(captured).unwrap();
    backend
        .run(captured, &[("x", f32s(&[1.0, 2.0, 3.0], &[3]))], &["y"])
        .await
        .unwrap();
    backend.end_capture(captured).unwrap();

    for values in [[-1.0, 0.0, 0.5], [10.0, 20.0, 30.0]] {
        let x = f32s(&values, &[3]);
        let replayed = backend.replay(captured, &[("x", x.clone())]).await.unwrap();
        let normal = backend.run(reference, &[("x", x)], &["y"]).await.unwrap();
        assert_eq!(
            replayed["y"].to_vec::<f32>().unwrap(),
            normal["y"].to_vec::<f32>().unwrap()
        );
    }
}

#[pollster::test]
async fn test_captured_buffers_stay_out_of_the_pool() {
    let (_, mut backend) = recording_backend(BackendConfig::default());
    let session = load(&mut backend, diamond_graph());

    backend.begin_capture(session).unwrap();
    backend
        .run(session, &[("x", f32s(&[1.0; 4], &[4]))], &["y"])
        .await
        .unwrap();
    backend.end_capture(session).unwrap();

    let buffers = backend.captured_buffers(session).unwrap();
    // x, left, right, y plus three uniform blocks
    assert_eq!(buffers.len(), 7);
    for &id in &buffers {
        assert_eq!(backend.memory().owner(id), Some(BufferOwner::Capture));
    }
    let stats = backend.memory_stats();
    assert_eq!(stats.captured, 7);
    assert_eq!(stats.idle, 0);

    // A second session cannot be handed any of them
    let other = load(&mut backend, diamond_graph());
    backend
        .run(other, &[("x", f32s(&[1.0; 4], &[4]))], &["y"])
        .await
        .unwrap();
    assert_eq!(backend.memory_stats().captured, 7);

    backend.clear_capture(session).unwrap();
    assert_eq!(backend.capture_status(session).unwrap(), CaptureStatus::Idle);
    assert_eq!(backend.memory_stats().captured, 0);
    assert!(backend.replay(session, &[]).await.is_err());
}

#[pollster::test]
async fn test_replay_rejects_mismatched_inputs() {
    let (_, mut backend) = recording_backend(BackendConfig::default());
    let session = load(&mut backend, chain_graph());
    backend.begin_capture(session).unwrap();
    backend
        .run(session, &[("x", f32s(&[1.0, 2.0, 3.0], &[3]))], &["y"])
        .await
        .unwrap();
    backend.end_capture(session).unwrap();

    let missing = backend.replay(session, &[]).await.unwrap_err();
    assert!(matches!(missing, RuntimeError::InvalidInputOutput(_)));

    let shape = backend
        .replay(session, &[("x", f32s(&[1.0, 2.0], &[2]))])
        .await
        .unwrap_err();
    assert!(matches!(shape, RuntimeError::InvalidInputOutput(_)));

    let unknown = [
        ("x", f32s(&[1.0, 2.0, 3.0], &[3])),
        ("z", f32s(&[1.0], &[1])),
    ];
    let err = backend.replay(session, &unknown).await.unwrap_err();
    assert!(matches!(err, RuntimeError::InvalidInputOutput(_)));

    // Still replayable afterwards
    let outputs = backend
        .replay(session, &[("x", f32s(&[0.0, 0.0, 0.0], &[3]))])
        .await
        .unwrap();
    assert_eq!(outputs["y"].to_vec::<f32>().unwrap(), vec![1.0, 1.0, 1.0]);
}

#[pollster::test]
async fn test_only_one_run_is_recorded() {
    let (_, mut backend) = recording_backend(BackendConfig::default());
    let session = load(&mut backend, chain_graph());
    let inputs = [("x", f32s(&[1.0, 2.0, 3.0], &[3]))];

    backend.begin_capture(session).unwrap();
    backend.run(session, &inputs, &["y"]).await.unwrap();
    let err = backend.run(session, &inputs, &["y"]).await.unwrap_err();
    assert!(matches!(err, RuntimeError::Capture(_)));
    assert!(matches!(
        backend.begin_capture(session),
        Err(RuntimeError::Capture(_))
    ));

    backend.end_capture(session).unwrap();
    assert!(backend.replay(session, &inputs).await.is_ok());
    // Normal runs keep working next to a frozen capture
    assert!(backend.run(session, &inputs, &["y"]).await.is_ok());
}

#[pollster::test]
async fn test_end_capture_without_a_run() {
    let (_, mut backend) = recording_backend(BackendConfig::default());
    let session = load(&mut backend, chain_graph());

    assert!(matches!(
        backend.end_capture(session),
        Err(RuntimeError::Capture(_))
    ));

    backend.begin_capture(session).unwrap();
    let err = backend.end_capture(session).unwrap_err();
    assert!(matches!(err, RuntimeError::Capture(_)));
    assert_eq!(backend.capture_status(session).unwrap(), CaptureStatus::Idle);

    // Released buffers go back to the pools again
    backend
        .run(session, &[("x", f32s(&[1.0, 2.0, 3.0], &[3]))], &["y"])
        .await
        .unwrap();
    assert_eq!(backend.memory_stats().captured, 0);
}

#[pollster::test]
async fn test_recapture_releases_the_previous_capture() {
    let (_, mut backend) = recording_backend(BackendConfig::default());
    let session = load(&mut backend, chain_graph());
    let inputs = [("x", f32s(&[1.0, 2.0, 3.0], &[3]))];
    // Pinned constants are referenced by the capture but never owned by it
    let owned = |backend: &Backend<RecordingDevice>| -> Vec<BufferId> {
        backend
            .captured_buffers(session)
            .unwrap()
            .into_iter()
            .filter(|&id| backend.memory().owner(id) == Some(BufferOwner::Capture))
            .collect()
    };

    backend.begin_capture(session).unwrap();
    backend.run(session, &inputs, &["y"]).await.unwrap();
    backend.end_capture(session).unwrap();
    let first = owned(&backend);
    assert_eq!(first.len(), 5);

    backend.begin_capture(session).unwrap();
    backend.run(session, &inputs, &["y"]).await.unwrap();
    backend.end_capture(session).unwrap();
    let second = owned(&backend);

    // Ids are never reused, even for recycled buffers
    assert_eq!(second.len(), 5);
    assert!(first.iter().all(|id| !second.contains(id)));
    assert_eq!(backend.memory_stats().captured, 5);
}

#[pollster::test]
async fn test_unregistered_external_output_invalidates_replay() {
    let (device, mut backend) = recording_backend(BackendConfig::default());
    let session = load(&mut backend, chain_graph());
    let buffer = device.create_buffer("y", 12, BufferUsage::Storage).unwrap();
    let y = backend.register_external_buffer(buffer, 12);
    let inputs = [("x", f32s(&[1.0, 2.0, 3.0], &[3]))];

    backend.begin_capture(session).unwrap();
    backend.run_into(session, &inputs, &[("y", y)]).unwrap();
    backend.end_capture(session).unwrap();
    assert!(backend.captured_buffers(session).unwrap().contains(&y));

    backend.unregister_external_buffer(y);
    let err = backend.replay(session, &inputs).await.unwrap_err();
    assert!(matches!(err, RuntimeError::ReplayInvalidation(_)), "{err}");
}

#[pollster::test]
async fn test_releasing_a_captured_buffer_invalidates_replay() {
    let (_, mut backend) =
        recording_backend(BackendConfig::default().with_capture_aliasing_assert(false));
    let session = load(&mut backend, chain_graph());
    let inputs = [("x", f32s(&[1.0, 2.0, 3.0], &[3]))];

    backend.begin_capture(session).unwrap();
    backend.run(session, &inputs, &["y"]).await.unwrap();
    backend.end_capture(session).unwrap();

    let victim = backend.captured_buffers(session).unwrap()[0];
    backend.memory_mut().release(victim).unwrap();

    let err = backend.replay(session, &inputs).await.unwrap_err();
    assert!(matches!(err, RuntimeError::ReplayInvalidation(_)), "{err}");
}

#[pollster::test]
#[should_panic(expected = "released while owned by a capture")]
async fn test_capture_aliasing_assert() {
    let (_, mut backend) =
        recording_backend(BackendConfig::default().with_capture_aliasing_assert(true));
    let session = load(&mut backend, chain_graph());

    backend.begin_capture(session).unwrap();
    backend
        .run(session, &[("x", f32s(&[1.0, 2.0, 3.0], &[3]))], &["y"])
        .await
        .unwrap();
    backend.end_capture(session).unwrap();

    let victim = backend.captured_buffers(session).unwrap()[0];
    let _ = backend.memory_mut().release(victim);
}

#[pollster::test]
async fn test_dispose_drops_the_capture() {
    let (device, mut backend) = recording_backend(BackendConfig::default());
    let session = load(&mut backend, chain_graph());

    backend.begin_capture(session).unwrap();
    backend
        .run(session, &[("x", f32s(&[1.0, 2.0, 3.0], &[3]))], &["y"])
        .await
        .unwrap();
    backend.end_capture(session).unwrap();
    backend.dispose(session).unwrap();

    let stats = backend.memory_stats();
    assert_eq!(stats.captured, 0);
    assert_eq!(stats.in_use, 0);
    assert_eq!(device.counters().live_buffers(), stats.idle);
    assert!(matches!(
        backend.replay(session, &[("x", Tensor::from_vec(vec![0.0f32; 3], &[3]).unwrap())]).await,
        Err(RuntimeError::InvalidInputOutput(_))
    ));
}

/// `y = neg(x)` over `x: f32[3]`, with an optional input `z` nothing reads.
fn neg_graph(with_unused: bool) -> Graph {
    let mut graph = Graph::new();
    let x = value(&mut graph, "x", &[3], ValueKind::Input);
    if with_unused {
        value(&mut graph, "z", &[2], ValueKind::Input);
    }
    let y = value(&mut graph, "y", &[3], ValueKind::Output);
    op(&mut graph, "Neg", "neg", &[x], &[y]);
    graph
}

#[pollster::test]
async fn test_replay_rejects_short_host_data() {
    let (device, mut backend) = recording_backend(BackendConfig::default());
    let session = load(&mut backend, neg_graph(false));
    backend.begin_capture(session).unwrap();
    backend
        .run(session, &[("x", f32s(&[1.0, 2.0, 3.0], &[3]))], &["y"])
        .await
        .unwrap();
    backend.end_capture(session).unwrap();

    let writes = device.counters().writes;
    let short = Tensor::from_raw(bytemuck::bytes_of(&9.0f32).to_vec(), &[3], DataType::F32);
    let err = backend.replay(session, &[("x", short)]).await.unwrap_err();
    assert!(matches!(err, RuntimeError::InvalidInputOutput(_)), "{err}");
    assert_eq!(device.counters().writes, writes);

    let outputs = backend
        .replay(session, &[("x", f32s(&[4.0, 5.0, 6.0], &[3]))])
        .await
        .unwrap();
    assert_eq!(outputs["y"].to_vec::<f32>().unwrap(), vec![-4.0, -5.0, -6.0]);
}

#[pollster::test]
async fn test_refused_recapture_keeps_the_frozen_capture() {
    let (_, mut backend) = recording_backend(BackendConfig::default());
    let first = load(&mut backend, neg_graph(false));
    let second = load(&mut backend, chain_graph());
    let x = f32s(&[1.0, 2.0, 3.0], &[3]);

    backend.begin_capture(second).unwrap();
    backend.run(second, &[("x", x.clone())], &["y"]).await.unwrap();
    backend.end_capture(second).unwrap();
    let captured = backend.captured_buffers(second).unwrap();

    backend.begin_capture(first).unwrap();
    let err = backend.begin_capture(second).unwrap_err();
    assert!(matches!(err, RuntimeError::Capture(_)), "{err}");
    assert_eq!(backend.capture_status(second).unwrap(), CaptureStatus::Frozen);
    assert_eq!(backend.captured_buffers(second).unwrap(), captured);

    let outputs = backend.replay(second, &[("x", x)]).await.unwrap();
    assert_eq!(outputs["y"].to_vec::<f32>().unwrap(), vec![3.0, 5.0, 7.0]);
}

#[pollster::test]
async fn test_replay_accepts_unused_inputs() {
    let (_, mut backend) = recording_backend(BackendConfig::default());
    let session = load(&mut backend, neg_graph(true));
    let inputs = [
        ("x", f32s(&[1.0, 2.0, 3.0], &[3])),
        ("z", f32s(&[7.0, 8.0], &[2])),
    ];

    backend.begin_capture(session).unwrap();
    backend.run(session, &inputs, &["y"]).await.unwrap();
    backend.end_capture(session).unwrap();

    let outputs = backend.replay(session, &inputs).await.unwrap();
    assert_eq!(outputs["y"].to_vec::<f32>().unwrap(), vec![-1.0, -2.0, -3.0]);
    let outputs = backend
        .replay(session, &[("x", f32s(&[0.0, 1.0, 0.0], &[3]))])
        .await
        .unwrap();
    assert_eq!(outputs["y"].to_vec::<f32>().unwrap(), vec![-0.0, -1.0, -0.0]);

    // Unused inputs are still checked against their declaration
    let wrong = [
        ("x", f32s(&[1.0, 2.0, 3.0], &[3])),
        ("z", f32s(&[7.0, 8.0, 9.0], &[3])),
    ];
    let err = backend.replay(session, &wrong).await.unwrap_err();
    assert!(matches!(err, RuntimeError::InvalidInputOutput(_)), "{err}");
}

#[pollster::test]
async fn test_replay_repeats_noop_copies_into_targets() {
    let (device, mut backend) = recording_backend(BackendConfig::default());
    let mut graph = Graph::new();
    let x = value(&mut graph, "x", &[2, 2], ValueKind::Input);
    let y = value(&mut graph, "y", &[4], ValueKind::Output);
    let reshape = op(&mut graph, "Reshape", "reshape", &[x], &[y]);
    graph.nodes[reshape].noop = true;
    let session = load(&mut backend, graph);
    let buffer = device.create_buffer("y", 16, BufferUsage::Storage).unwrap();
    let y = backend.register_external_buffer(buffer, 16);

    backend.begin_capture(session).unwrap();
    let inputs = [("x", f32s(&[1.0, 2.0, 3.0, 4.0], &[2, 2]))];
    backend.run_into(session, &inputs, &[("y", y)]).unwrap();
    backend.end_capture(session).unwrap();

    let outputs = backend
        .replay(session, &[("x", f32s(&[4.0, 3.0, 2.0, 1.0], &[2, 2]))])
        .await
        .unwrap();
    assert_eq!(outputs["y"].to_vec::<f32>().unwrap(), vec![4.0, 3.0, 2.0, 1.0]);
    assert_eq!(device.counters().copies, 2);
}
