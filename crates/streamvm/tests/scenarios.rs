//! End-to-end behavior of the VM against representative workloads.

use std::time::Duration;

use streamvm::prelude::*;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("streamvm_core=debug")
        .with_test_writer()
        .try_init();
}

/// Two instructions on one CPU stream: the second reads what the first
/// wrote and is not dispatched before the first completes.
#[test]
fn test_dependent_pair_on_cpu() {
    init_tracing();
    let mut vm = StreamVm::builder().build().unwrap();
    let r1 = Buffer::new("r1", 8);
    let r2 = Buffer::new("r2", 8);

    let i1 = vm
        .enqueue(
            InstructionMsg::from_fn(StreamSelector::cpu(0), "produce", |ctx| {
                std::thread::sleep(Duration::from_millis(10));
                ctx.buffer(0)?.write_u64(41)
            })
            .write(&r1),
        )
        .unwrap();
    let i2 = vm
        .enqueue(
            InstructionMsg::from_fn(StreamSelector::cpu(0), "increment", |ctx| {
                let value = ctx.buffer(0)?.read_u64()?;
                ctx.buffer(1)?.write_u64(value + 1)
            })
            .read(&r1)
            .write(&r2)
            .after(&i1),
        )
        .unwrap();

    assert_eq!(i2.state(), InstructionState::Pending);
    while !i2.is_done() {
        vm.tick().unwrap();
        if !i1.is_done() {
            assert!(i2.state() < InstructionState::Dispatched);
        }
    }

    assert_eq!(r2.read_u64().unwrap(), 42);
    vm.run_until_idle().unwrap();
    assert_eq!(vm.live_instructions(), 0);
}

/// Without accelerators there are no accelerator streams to select.
#[test]
fn test_no_accelerator_streams() {
    let mut vm = StreamVm::builder().gpu_devices(0).build().unwrap();

    assert_eq!(vm.stream_count(StreamKind::GpuCompute), 0);
    assert_eq!(vm.stream_count(StreamKind::GpuCopyH2D), 0);
    assert!(vm.streams().all(|s| s.kind() == StreamKind::Cpu));

    let err = vm
        .enqueue(InstructionMsg::from_fn(StreamSelector::gpu(0), "k", |_| Ok(())))
        .unwrap_err();
    assert_eq!(
        err,
        VmError::InvalidStreamSelector {
            instruction: "k".to_string(),
            kind: StreamKind::GpuCompute,
            device_id: 0,
            available: 0,
        }
    );
    assert!(err.is_config_error());
    assert_eq!(vm.live_instructions(), 0);
}

/// Staging through the copy engines: host -> device, compute, device -> host.
#[test]
fn test_copy_compute_copy_chain() {
    let mut vm = StreamVm::builder().gpu_devices(1).build().unwrap();
    let host_in = Buffer::from_bytes("host_in", 20u64.to_le_bytes().to_vec());
    let dev_in = Buffer::new("dev_in", 8);
    let dev_out = Buffer::new("dev_out", 8);
    let host_out = Buffer::new("host_out", 8);

    let copy = |selector: StreamSelector, name: &str| {
        InstructionMsg::from_fn(selector, name, |ctx| {
            let src = ctx.buffer(0)?.clone();
            let dst = ctx.buffer(1)?.clone();
            ctx.launch(move || dst.write_u64(src.read_u64()?))
        })
    };

    vm.enqueue(copy(StreamSelector::copy_h2d(0), "h2d").read(&host_in).write(&dev_in))
        .unwrap();
    vm.enqueue(
        InstructionMsg::from_fn(StreamSelector::gpu(0), "double", |ctx| {
            let src = ctx.buffer(0)?.clone();
            let dst = ctx.buffer(1)?.clone();
            ctx.launch(move || dst.write_u64(src.read_u64()? * 2))
        })
        .read(&dev_in)
        .write(&dev_out),
    )
    .unwrap();
    let last = vm
        .enqueue(copy(StreamSelector::copy_d2h(0), "d2h").read(&dev_out).write(&host_out))
        .unwrap();

    vm.run_until_done(&last).unwrap();
    assert_eq!(host_out.read_u64().unwrap(), 40);
    vm.run_until_idle().unwrap();

    let gpu = StreamId::new(StreamKind::GpuCompute, 0);
    assert_eq!(dev_out.placement(), Some(gpu));
}

/// A failing launch on a single-slot accelerator stream terminates the VM
/// and nothing behind it is dispatched.
#[test]
fn test_kernel_failure_is_fatal() {
    init_tracing();
    let mut vm = StreamVm::builder().gpu_devices(1).build().unwrap();

    let mut handles = Vec::new();
    for i in 0..5 {
        let fail = i == 1;
        handles.push(
            vm.enqueue(InstructionMsg::from_fn(
                StreamSelector::gpu(0),
                format!("k{}", i),
                move |ctx| {
                    ctx.launch(move || {
                        if fail {
                            Err(VmError::kernel("illegal address"))
                        } else {
                            Ok(())
                        }
                    })
                },
            ))
            .unwrap(),
        );
    }

    let err = vm.run_until_idle().unwrap_err();
    match &err {
        VmError::Hardware { stream, message } => {
            assert_eq!(stream.to_string(), "gpu-compute:0");
            assert!(message.contains("illegal address"), "{}", message);
        }
        other => panic!("expected hardware error, got {:?}", other),
    }
    assert!(err.is_fatal());

    for handle in &handles[2..] {
        assert!(handle.state() < InstructionState::Dispatched);
    }
    assert_eq!(vm.metrics().dispatched, 2);
    assert_eq!(vm.fatal_error(), Some(&err));

    assert!(matches!(vm.tick(), Err(VmError::Terminated(_))));
    let late = vm.enqueue(InstructionMsg::from_fn(StreamSelector::cpu(0), "late", |_| Ok(())));
    assert!(matches!(late, Err(VmError::Terminated(_))));
}

/// A payload that fails while launching terminates the VM at dispatch.
#[test]
fn test_launch_failure_is_fatal() {
    let mut vm = StreamVm::builder().gpu_devices(1).build().unwrap();
    vm.enqueue(InstructionMsg::from_fn(StreamSelector::gpu(0), "bad", |_| {
        Err(VmError::kernel("invalid configuration"))
    }))
    .unwrap();

    let err = vm.run_until_idle().unwrap_err();
    assert!(matches!(err, VmError::Hardware { .. }));
    assert!(err.to_string().contains("bad"));
}

/// A CPU payload error surfaces through the status flag.
#[test]
fn test_cpu_failure_is_fatal() {
    let mut vm = StreamVm::builder().build().unwrap();
    vm.enqueue(InstructionMsg::from_fn(StreamSelector::cpu(0), "broken", |_| {
        Err(VmError::kernel("bad input"))
    }))
    .unwrap();

    let err = vm.run_until_idle().unwrap_err();
    match err {
        VmError::Hardware { stream, message } => {
            assert_eq!(stream, StreamId::new(StreamKind::Cpu, 0));
            assert!(message.contains("bad input"));
        }
        other => panic!("expected hardware error, got {:?}", other),
    }
}

/// Lazily allocated outputs that exceed the stream's memory terminate the VM.
#[test]
fn test_out_of_memory() {
    let mut vm = StreamVm::builder()
        .gpu_devices(1)
        .device_mem_mbyte(1)
        .build()
        .unwrap();
    let huge = Buffer::new("huge", 4 << 20);

    vm.enqueue(
        InstructionMsg::from_fn(StreamSelector::gpu(0), "fill", |ctx| {
            let out = ctx.buffer(0)?.clone();
            ctx.launch(move || out.write(|bytes| bytes.fill(1)))
        })
        .write(&huge),
    )
    .unwrap();

    let err = vm.run_until_idle().unwrap_err();
    assert!(matches!(err, VmError::OutOfMemory { .. }));
    assert!(!huge.is_allocated());
}

/// Operand contracts are checked at submission.
#[test]
fn test_operand_contracts() {
    let mut vm = StreamVm::builder().build().unwrap();
    let buf = Buffer::new("buf", 8);

    let err = vm
        .enqueue(
            InstructionMsg::from_fn(StreamSelector::cpu(0), "twice", |_| Ok(()))
                .read(&buf)
                .write(&buf),
        )
        .unwrap_err();
    assert!(matches!(err, VmError::OperandConflict { .. }));
    assert!(err.is_contract_violation());

    vm.release_buffer(&buf).unwrap();
    let err = vm
        .enqueue(InstructionMsg::from_fn(StreamSelector::cpu(0), "late", |_| Ok(())).read(&buf))
        .unwrap_err();
    assert!(matches!(err, VmError::BufferReleased { .. }));

    // Contract violations are not fatal.
    assert!(vm.fatal_error().is_none());
}

/// Deferred release frees the body only after the last accessor retires.
#[test]
fn test_release_after_last_accessor() {
    let mut vm = StreamVm::builder().build().unwrap();
    let buf = Buffer::new("buf", 8);

    let write = vm
        .enqueue(
            InstructionMsg::from_fn(StreamSelector::cpu(0), "write", |ctx| {
                std::thread::sleep(Duration::from_millis(10));
                ctx.buffer(0)?.write_u64(3)
            })
            .write(&buf),
        )
        .unwrap();
    vm.release_buffer(&buf).unwrap();

    vm.run_until_done(&write).unwrap();
    vm.run_until_idle().unwrap();
    assert!(!buf.is_allocated());
}

/// Shutdown drains live work and refuses new submissions.
#[test]
fn test_shutdown_drains() {
    let mut vm = StreamVm::builder().build().unwrap();
    let out = Buffer::new("out", 8);
    let handle = vm
        .enqueue(
            InstructionMsg::from_fn(StreamSelector::cpu(0), "fill", |ctx| {
                std::thread::sleep(Duration::from_millis(10));
                ctx.buffer(0)?.write_u64(5)
            })
            .write(&out),
        )
        .unwrap();

    vm.request_shutdown();
    assert!(vm.is_shutting_down());
    assert_eq!(
        vm.enqueue(InstructionMsg::from_fn(StreamSelector::cpu(0), "late", |_| Ok(())))
            .unwrap_err(),
        VmError::ShutDown
    );

    vm.shutdown().unwrap();
    assert!(handle.is_done());
    assert_eq!(vm.live_instructions(), 0);
}
