//! Pipeline construction and the cooperative turn loop.

use tracing::{debug, info};

use crate::error::{Result, VmError};
use crate::scheduler::VirtualMachine;

use super::message::{ActorMsgKind, MessageBus};
use super::register::Consumer;
use super::{Actor, ActorId, ActorState, ActorStats, RegisterDesc, StageKernel};

/// What one [`Pipeline::turn`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TurnReport {
    /// Messages delivered.
    pub delivered: usize,
    /// Actors that acted or changed state.
    pub acted: usize,
    /// Whether the VM tick made progress.
    pub vm_progress: bool,
}

impl TurnReport {
    /// Whether anything changed.
    pub fn made_progress(&self) -> bool {
        self.delivered > 0 || self.acted > 0 || self.vm_progress
    }
}

/// A set of connected actors plus their message bus.
#[derive(Debug, Default)]
pub struct Pipeline {
    actors: Vec<Actor>,
    bus: MessageBus,
    started: bool,
    turns: u64,
}

impl Pipeline {
    /// Empty pipeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a stage.
    pub fn add_actor(&mut self, name: impl Into<String>, kernel: impl StageKernel) -> ActorId {
        let id = ActorId(self.actors.len());
        self.actors.push(Actor::new(id, name.into(), Box::new(kernel)));
        id
    }

    /// Give a stage an output register.
    pub fn add_output(&mut self, actor: ActorId, desc: RegisterDesc) -> Result<()> {
        let actor = self.actor_mut(actor)?;
        if actor.output(&desc.name).is_some() {
            return Err(VmError::InvalidConfig(format!(
                "actor '{}' already has register '{}'",
                actor.name(),
                desc.name
            )));
        }
        actor.add_output(&desc);
        Ok(())
    }

    /// Connect `producer.output` to `consumer.input`, creating the input
    /// register on first use.
    pub fn connect(
        &mut self,
        producer: ActorId,
        output: &str,
        consumer: ActorId,
        input: &str,
    ) -> Result<()> {
        let taken = self
            .actor(consumer)?
            .input(input)
            .map_or(false, |r| r.producer.is_some());
        if taken {
            return Err(VmError::InvalidConfig(format!(
                "input register '{}' already has a producer",
                input
            )));
        }
        self.actor_mut(producer)?.connect_output(
            output,
            Consumer {
                actor: consumer,
                register: input.to_string(),
            },
        )?;

        let register = self.actor_mut(consumer)?.ensure_input(input);
        register.producer = Some(Consumer {
            actor: producer,
            register: output.to_string(),
        });
        debug!(%producer, output, %consumer, input, "Connected registers");
        Ok(())
    }

    /// Send `Start` to every source stage.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        for actor in &self.actors {
            if actor.is_source() {
                self.bus.send(actor.id(), actor.id(), ActorMsgKind::Start);
            }
        }
        self.started = true;
        info!(actors = self.actors.len(), "Pipeline started");
        Ok(())
    }

    /// One cooperative round: deliver queued messages, offer every actor
    /// one act, then tick the VM.
    pub fn turn(&mut self, vm: &mut VirtualMachine) -> Result<TurnReport> {
        let mut report = TurnReport::default();
        self.turns += 1;

        for msg in self.bus.drain() {
            let dst = msg.dst;
            let actor = self
                .actors
                .get_mut(dst.index())
                .ok_or_else(|| VmError::UnknownActor(dst.to_string()))?;
            actor.handle(msg, &mut self.bus)?;
            report.delivered += 1;
        }

        for actor in &mut self.actors {
            if actor.try_act(vm, &mut self.bus)? {
                report.acted += 1;
            }
        }

        report.vm_progress = vm.tick()?.made_progress();
        Ok(report)
    }

    /// Run turns until every actor is done and the VM drained.
    ///
    /// Fails if the pipeline can make no further progress.
    pub fn run_to_completion(&mut self, vm: &mut VirtualMachine) -> Result<()> {
        self.start()?;
        while !self.is_done() {
            let report = self.turn(vm)?;
            if !report.made_progress() {
                if vm.is_idle() && self.bus.is_empty() {
                    let stuck: Vec<&str> = self
                        .actors
                        .iter()
                        .filter(|a| a.state() != ActorState::Done)
                        .map(|a| a.name())
                        .collect();
                    return Err(VmError::InvalidConfig(format!(
                        "pipeline stalled with actors not done: {}",
                        stuck.join(", ")
                    )));
                }
                std::thread::yield_now();
            }
        }
        vm.run_until_idle()?;
        info!(
            turns = self.turns,
            messages = self.bus.sent(),
            "Pipeline finished"
        );
        Ok(())
    }

    /// Whether every actor is done.
    pub fn is_done(&self) -> bool {
        self.actors.iter().all(|a| a.state() == ActorState::Done)
    }

    /// Actor by id.
    pub fn actor(&self, id: ActorId) -> Result<&Actor> {
        self.actors
            .get(id.index())
            .ok_or_else(|| VmError::UnknownActor(id.to_string()))
    }

    /// Actor by name.
    pub fn actor_by_name(&self, name: &str) -> Option<&Actor> {
        self.actors.iter().find(|a| a.name() == name)
    }

    /// All actors.
    pub fn actors(&self) -> &[Actor] {
        &self.actors
    }

    /// Stats of every actor, by name.
    pub fn stats(&self) -> Vec<(String, ActorStats)> {
        self.actors
            .iter()
            .map(|a| (a.name().to_string(), a.stats()))
            .collect()
    }

    /// Turns run so far.
    pub fn turns(&self) -> u64 {
        self.turns
    }

    fn actor_mut(&mut self, id: ActorId) -> Result<&mut Actor> {
        self.actors
            .get_mut(id.index())
            .ok_or_else(|| VmError::UnknownActor(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActContext;
    use crate::config::VmConfig;
    use crate::instruction::{InstructionMsg, StreamSelector};
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct Counter {
        next: u64,
        limit: u64,
    }

    impl StageKernel for Counter {
        fn act(&mut self, ctx: &mut ActContext<'_>) -> Result<()> {
            let out = ctx.output("out")?.clone();
            let target = out.clone();
            let value = self.next;
            self.next += 1;
            ctx.enqueue(
                InstructionMsg::from_fn(StreamSelector::cpu(0), "emit", move |_| {
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

    struct Collect(Arc<Mutex<Vec<u64>>>);

    impl StageKernel for Collect {
        fn act(&mut self, ctx: &mut ActContext<'_>) -> Result<()> {
            let input = ctx.input("in")?.clone();
            let source = input.clone();
            let sink = Arc::clone(&self.0);
            ctx.enqueue(
                InstructionMsg::from_fn(StreamSelector::cpu(0), "collect", move |_| {
                    sink.lock().push(source.read_u64()?);
                    Ok(())
                })
                .read(&input),
            )?;
            Ok(())
        }
    }

    #[test]
    fn test_two_stage_pipeline() {
        let mut vm = VirtualMachine::new(VmConfig::cpu_only()).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let mut pipeline = Pipeline::new();
        let src = pipeline.add_actor("source", Counter { next: 0, limit: 4 });
        let dst = pipeline.add_actor("sink", Collect(Arc::clone(&seen)));
        pipeline.add_output(src, RegisterDesc::new("out", 1, 8)).unwrap();
        pipeline.connect(src, "out", dst, "in").unwrap();

        pipeline.run_to_completion(&mut vm).unwrap();

        assert_eq!(*seen.lock(), vec![0, 1, 2, 3]);
        assert!(pipeline.is_done());
        assert!(vm.is_idle());
        assert_eq!(pipeline.actor(src).unwrap().stats().acts, 4);
    }

    struct Zip(Arc<Mutex<Vec<u64>>>);

    impl StageKernel for Zip {
        fn act(&mut self, ctx: &mut ActContext<'_>) -> Result<()> {
            let left = ctx.input("left")?.clone();
            let right = ctx.input("right")?.clone();
            let (a, b) = (left.clone(), right.clone());
            let sink = Arc::clone(&self.0);
            ctx.enqueue(
                InstructionMsg::from_fn(StreamSelector::cpu(0), "zip", move |_| {
                    sink.lock().push(a.read_u64()? + b.read_u64()?);
                    Ok(())
                })
                .read(&left)
                .read(&right),
            )?;
            Ok(())
        }
    }

    #[test]
    fn test_zip_with_unequal_sources() {
        let mut vm = VirtualMachine::new(VmConfig::cpu_only()).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let mut pipeline = Pipeline::new();
        let short = pipeline.add_actor("short", Counter { next: 0, limit: 2 });
        let long = pipeline.add_actor("long", Counter { next: 0, limit: 4 });
        let zip = pipeline.add_actor("zip", Zip(Arc::clone(&seen)));
        pipeline.add_output(short, RegisterDesc::new("out", 1, 8)).unwrap();
        pipeline.add_output(long, RegisterDesc::new("out", 1, 8)).unwrap();
        pipeline.connect(short, "out", zip, "left").unwrap();
        pipeline.connect(long, "out", zip, "right").unwrap();

        pipeline.run_to_completion(&mut vm).unwrap();

        assert_eq!(*seen.lock(), vec![0, 2]);
        assert!(pipeline.is_done());
        let long = pipeline.actor(long).unwrap().stats();
        assert_eq!(long.acts, 4);
        assert_eq!(long.state, ActorState::Done);
        assert_eq!(pipeline.actor(zip).unwrap().stats().acts, 2);
        assert!(vm.is_idle());
    }

    #[test]
    fn test_connect_errors() {
        let mut pipeline = Pipeline::new();
        let a = pipeline.add_actor("a", Counter { next: 0, limit: 1 });
        let b = pipeline.add_actor("b", Collect(Arc::new(Mutex::new(Vec::new()))));

        assert!(matches!(
            pipeline.connect(a, "out", b, "in"),
            Err(VmError::RegisterNotFound { .. })
        ));
        assert!(matches!(
            pipeline.connect(a, "out", ActorId(7), "in"),
            Err(VmError::UnknownActor(_))
        ));

        pipeline.add_output(a, RegisterDesc::new("out", 1, 8)).unwrap();
        assert!(pipeline.add_output(a, RegisterDesc::new("out", 1, 8)).is_err());
        pipeline.connect(a, "out", b, "in").unwrap();
        assert!(matches!(
            pipeline.connect(a, "out", b, "in"),
            Err(VmError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_stall_detected() {
        let mut vm = VirtualMachine::new(VmConfig::cpu_only()).unwrap();
        let mut pipeline = Pipeline::new();
        // A consumer whose input has no producer can never finish.
        let orphan = pipeline.add_actor("orphan", Collect(Arc::new(Mutex::new(Vec::new()))));
        pipeline.actor_mut(orphan).unwrap().ensure_input("in");

        let err = pipeline.run_to_completion(&mut vm).unwrap_err();
        assert!(err.to_string().contains("orphan"));
    }
}
