//! Multi-stage actor pipelines over the VM.

use std::sync::Arc;

use parking_lot::Mutex;
use streamvm::prelude::*;

struct Source {
    next: u64,
    limit: u64,
}

impl StageKernel for Source {
    fn act(&mut self, ctx: &mut ActContext<'_>) -> Result<()> {
        let out = ctx.output("out")?.clone();
        let target = out.clone();
        let value = self.next;
        self.next += 1;
        ctx.enqueue(
            InstructionMsg::from_fn(StreamSelector::cpu(0), "source.emit", move |_| {
                target.write_u64(value)
            })
            .write(&out),
        )?;
        Ok(())
    }

    fn has_more_input(&self) -> bool {
        self.next < self.limit
    }
}

/// Multiplies every item, optionally on the accelerator.
struct Scale {
    factor: u64,
    selector: StreamSelector,
}

impl StageKernel for Scale {
    fn act(&mut self, ctx: &mut ActContext<'_>) -> Result<()> {
        let input = ctx.input("in")?.clone();
        let out = ctx.output("out")?.clone();
        let factor = self.factor;
        ctx.enqueue(
            InstructionMsg::from_fn(self.selector, "scale", move |c| {
                let src = c.buffer(0)?.clone();
                let dst = c.buffer(1)?.clone();
                c.launch(move || dst.write_u64(src.read_u64()? * factor))
            })
            .read(&input)
            .write(&out),
        )?;
        Ok(())
    }
}

struct Sink(Arc<Mutex<Vec<u64>>>);

impl StageKernel for Sink {
    fn act(&mut self, ctx: &mut ActContext<'_>) -> Result<()> {
        let input = ctx.input("in")?.clone();
        let source = input.clone();
        let seen = Arc::clone(&self.0);
        ctx.enqueue(
            InstructionMsg::from_fn(StreamSelector::cpu(0), "sink.collect", move |_| {
                seen.lock().push(source.read_u64()?);
                Ok(())
            })
            .read(&input),
        )?;
        Ok(())
    }
}

fn three_stage(
    pipeline: &mut Pipeline,
    items: u64,
    selector: StreamSelector,
    seen: &Arc<Mutex<Vec<u64>>>,
) -> (ActorId, ActorId, ActorId) {
    let produce = pipeline.add_actor("produce", Source { next: 0, limit: items });
    let transform = pipeline.add_actor("transform", Scale { factor: 10, selector });
    let consume = pipeline.add_actor("consume", Sink(Arc::clone(seen)));

    pipeline.add_output(produce, RegisterDesc::new("out", 1, 8)).unwrap();
    pipeline.add_output(transform, RegisterDesc::new("out", 1, 8)).unwrap();
    pipeline.connect(produce, "out", transform, "in").unwrap();
    pipeline.connect(transform, "out", consume, "in").unwrap();
    (produce, transform, consume)
}

#[test]
fn test_three_stage_single_slot() {
    let mut vm = StreamVm::builder().build().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut pipeline = Pipeline::new();
    let (produce, transform, consume) =
        three_stage(&mut pipeline, 5, StreamSelector::cpu(0), &seen);

    pipeline.run_to_completion(&mut vm).unwrap();

    assert_eq!(*seen.lock(), vec![0, 10, 20, 30, 40]);
    assert!(pipeline.is_done());
    for id in [produce, transform, consume] {
        let actor = pipeline.actor(id).unwrap();
        assert_eq!(actor.state(), ActorState::Done);
        assert_eq!(actor.stats().acts, 5);
    }
    assert!(pipeline.actor(transform).unwrap().stats().write_stalls > 0);
    assert!(vm.is_idle());
}

#[test]
fn test_transform_on_accelerator() {
    let mut vm = StreamVm::builder().gpu_devices(1).build().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut pipeline = Pipeline::new();
    three_stage(&mut pipeline, 8, StreamSelector::gpu(0), &seen);

    pipeline.run_to_completion(&mut vm).unwrap();

    let expected: Vec<u64> = (0..8).map(|i| i * 10).collect();
    assert_eq!(*seen.lock(), expected);

    let gpu = StreamId::new(StreamKind::GpuCompute, 0);
    assert_eq!(vm.metrics().stream(gpu).unwrap().metrics.completed, 8);
}

#[test]
fn test_wider_registers_keep_order() {
    let mut vm = StreamVm::builder().cpu_devices(2).build().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut pipeline = Pipeline::new();

    let produce = pipeline.add_actor("produce", Source { next: 0, limit: 12 });
    let transform = pipeline.add_actor(
        "transform",
        Scale {
            factor: 3,
            selector: StreamSelector::cpu(1),
        },
    );
    let consume = pipeline.add_actor("consume", Sink(Arc::clone(&seen)));
    pipeline.add_output(produce, RegisterDesc::new("out", 3, 8)).unwrap();
    pipeline.add_output(transform, RegisterDesc::new("out", 2, 8)).unwrap();
    pipeline.connect(produce, "out", transform, "in").unwrap();
    pipeline.connect(transform, "out", consume, "in").unwrap();

    pipeline.run_to_completion(&mut vm).unwrap();

    let expected: Vec<u64> = (0..12).map(|i| i * 3).collect();
    assert_eq!(*seen.lock(), expected);
}

#[test]
fn test_turns_respect_register_capacity() {
    let mut vm = StreamVm::builder().build().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut pipeline = Pipeline::new();
    let (produce, transform, consume) =
        three_stage(&mut pipeline, 5, StreamSelector::cpu(0), &seen);
    pipeline.start().unwrap();

    let acts = |pipeline: &Pipeline, id: ActorId| pipeline.actor(id).unwrap().stats().acts;
    let mut widest = [0u64; 2];
    while !pipeline.is_done() {
        let before = [produce, transform, consume].map(|id| acts(&pipeline, id));
        pipeline.turn(&mut vm).unwrap();
        let after = [produce, transform, consume].map(|id| acts(&pipeline, id));

        for (b, a) in before.iter().zip(&after) {
            assert!(a - b <= 1, "an actor acted more than once in a turn");
        }
        // A stage never runs more than one register's worth of items ahead
        // of the stage reading from it.
        for (stage, pair) in after.windows(2).enumerate() {
            let ahead = pair[0] - pair[1];
            assert!(ahead <= 1, "stage {} is {} items ahead", stage, ahead);
            widest[stage] = widest[stage].max(ahead);
        }
        if !pipeline.is_done() {
            vm.tick().unwrap();
        }
    }
    vm.run_until_idle().unwrap();

    assert_eq!(seen.lock().len(), 5);
    assert_eq!(widest, [1, 1]);
    assert!(pipeline.actor(produce).unwrap().stats().write_stalls > 0);
    assert!(pipeline.actor(transform).unwrap().stats().write_stalls > 0);
}

#[test]
fn test_empty_source_finishes() {
    let mut vm = StreamVm::builder().build().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut pipeline = Pipeline::new();
    three_stage(&mut pipeline, 0, StreamSelector::cpu(0), &seen);

    pipeline.run_to_completion(&mut vm).unwrap();

    assert!(seen.lock().is_empty());
    assert!(pipeline.is_done());
}
