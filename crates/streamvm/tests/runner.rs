//! The background scheduler thread.

use std::sync::Arc;
use std::time::Duration;

use streamvm::prelude::*;

fn fill(selector: StreamSelector, out: &Buffer, value: u64) -> InstructionMsg {
    InstructionMsg::from_fn(selector, "fill", move |ctx| ctx.buffer(0)?.write_u64(value))
        .write(out)
}

#[tokio::test]
async fn test_wait_done() {
    let runner = StreamVm::builder().gpu_devices(1).spawn().unwrap();
    let out = Buffer::new("out", 8);

    let handle = runner.enqueue(fill(StreamSelector::cpu(0), &out, 17)).unwrap();
    runner.wait_done(&handle).await.unwrap();

    assert!(runner.is_done(&handle));
    assert_eq!(out.read_u64().unwrap(), 17);
    runner.shutdown().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_submitters() {
    let runner = Arc::new(StreamVm::builder().cpu_devices(2).spawn().unwrap());

    let mut tasks = Vec::new();
    for i in 0..4u64 {
        let runner = Arc::clone(&runner);
        tasks.push(tokio::spawn(async move {
            let out = Buffer::new(format!("out{}", i), 8);
            let handle = runner
                .enqueue(fill(StreamSelector::cpu((i % 2) as usize), &out, i * 100))
                .unwrap();
            runner.wait_done(&handle).await.unwrap();
            out.read_u64().unwrap()
        }));
    }

    let mut results = Vec::new();
    for task in tasks {
        results.push(task.await.unwrap());
    }
    results.sort_unstable();
    assert_eq!(results, vec![0, 100, 200, 300]);

    let runner = Arc::try_unwrap(runner).unwrap();
    assert_eq!(runner.metrics().enqueued, 4);
    runner.shutdown().unwrap();
}

#[tokio::test]
async fn test_wait_reports_fatal_error() {
    let runner = StreamVm::builder()
        .poll_interval(Duration::from_millis(1))
        .spawn()
        .unwrap();

    let handle = runner
        .enqueue(InstructionMsg::from_fn(StreamSelector::cpu(0), "broken", |_| {
            Err(VmError::kernel("bad input"))
        }))
        .unwrap();

    let err = runner.wait_done(&handle).await.unwrap_err();
    match err {
        VmError::Terminated(cause) => {
            assert!(matches!(*cause, VmError::Hardware { .. }));
        }
        other => panic!("expected termination, got {:?}", other),
    }
    assert!(runner.fatal_error().is_some());
    match runner.shutdown() {
        Err(VmError::Hardware { message, .. }) => assert!(message.contains("bad input")),
        other => panic!("expected the original hardware error, got {:?}", other),
    }
}

#[test]
fn test_block_until_done_timeout() {
    let runner = StreamVm::builder().spawn().unwrap();
    let gate = Buffer::new("gate", 8);

    let slow = runner
        .enqueue(
            InstructionMsg::from_fn(StreamSelector::cpu(0), "slow", |ctx| {
                std::thread::sleep(Duration::from_millis(200));
                ctx.buffer(0)?.write_u64(1)
            })
            .write(&gate),
        )
        .unwrap();

    assert_eq!(
        runner.block_until_done_timeout(&slow, Duration::from_millis(10)),
        Err(VmError::Timeout(Duration::from_millis(10)))
    );
    runner.block_until_done(&slow).unwrap();
    runner.shutdown().unwrap();
}

#[test]
fn test_pipeline_through_runner() {
    struct Count(u64);

    impl StageKernel for Count {
        fn act(&mut self, ctx: &mut ActContext<'_>) -> Result<()> {
            let out = ctx.output("out")?.clone();
            let value = self.0;
            self.0 += 1;
            ctx.enqueue(fill(StreamSelector::cpu(0), &out, value))?;
            Ok(())
        }

        fn has_more_input(&self) -> bool {
            self.0 < 3
        }
    }

    let runner = StreamVm::builder().spawn().unwrap();
    let mut pipeline = Pipeline::new();
    let source = pipeline.add_actor("count", Count(0));
    pipeline.add_output(source, RegisterDesc::new("out", 2, 8)).unwrap();

    runner
        .with_vm(|vm| pipeline.run_to_completion(vm))
        .unwrap();

    assert!(pipeline.is_done());
    assert_eq!(pipeline.actor(source).unwrap().stats().acts, 3);
    runner.shutdown().unwrap();
}

#[test]
fn test_instruction_info_becomes_stale() {
    let runner = StreamVm::builder().spawn().unwrap();
    let out = Buffer::new("out", 8);
    let handle = runner.enqueue(fill(StreamSelector::cpu(0), &out, 1)).unwrap();

    runner.block_until_done(&handle).unwrap();
    while handle.state() != InstructionState::Retired {
        std::thread::yield_now();
    }
    assert_eq!(
        runner.instruction_info(&handle).unwrap_err(),
        VmError::StaleHandle(handle.id())
    );
    runner.shutdown().unwrap();
}
