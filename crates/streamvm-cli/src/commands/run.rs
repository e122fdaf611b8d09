//! `streamvm run` command - Drive a produce/transform/consume pipeline.

use std::sync::Arc;
use std::time::Instant;

use colored::Colorize;
use parking_lot::Mutex;
use serde::Serialize;
use streamvm::prelude::*;
use tracing::info;

use super::{load_config, OutputFormat};
use crate::error::CliResult;

/// Options for one pipeline run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Items the source stage produces.
    pub items: u64,
    /// Multiplier applied by the transform stage.
    pub factor: u64,
    /// Slots per register.
    pub slots: usize,
    /// Accelerator override.
    pub gpu: Option<usize>,
    /// Per-stream in-flight override.
    pub max_in_flight: Option<usize>,
}

/// What a run produced.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Stream the transform stage ran on.
    pub transform_stream: String,
    /// Items in the order the consumer saw them.
    pub items: Vec<u64>,
    /// Wall time in milliseconds.
    pub elapsed_ms: f64,
    /// Per-actor counters.
    pub actors: Vec<(String, ActorStats)>,
    /// VM counters.
    pub metrics: VmMetrics,
}

struct Produce {
    next: u64,
    limit: u64,
}

impl StageKernel for Produce {
    fn act(&mut self, ctx: &mut ActContext<'_>) -> Result<()> {
        let out = ctx.output("out")?.clone();
        let value = self.next;
        self.next += 1;
        ctx.enqueue(
            InstructionMsg::from_fn(StreamSelector::cpu(0), "produce", move |c| {
                c.buffer(0)?.write_u64(value)
            })
            .write(&out),
        )?;
        Ok(())
    }

    fn has_more_input(&self) -> bool {
        self.next < self.limit
    }
}

struct Transform {
    selector: StreamSelector,
    factor: u64,
}

impl StageKernel for Transform {
    fn act(&mut self, ctx: &mut ActContext<'_>) -> Result<()> {
        let input = ctx.input("in")?.clone();
        let out = ctx.output("out")?.clone();
        let factor = self.factor;
        ctx.enqueue(
            InstructionMsg::from_fn(self.selector, "transform", move |c| {
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

struct Consume(Arc<Mutex<Vec<u64>>>);

impl StageKernel for Consume {
    fn act(&mut self, ctx: &mut ActContext<'_>) -> Result<()> {
        let input = ctx.input("in")?.clone();
        let items = Arc::clone(&self.0);
        ctx.enqueue(
            InstructionMsg::from_fn(StreamSelector::cpu(0), "consume", move |c| {
                items.lock().push(c.buffer(0)?.read_u64()?);
                Ok(())
            })
            .read(&input),
        )?;
        Ok(())
    }
}

/// Build the VM, run the pipeline to completion and shut down.
pub fn run_pipeline(config: VmConfig, options: &RunOptions) -> CliResult<RunReport> {
    let mut builder = StreamVm::builder().config(config);
    if let Some(gpu) = options.gpu {
        builder = builder.gpu_devices(gpu);
    }
    if let Some(max) = options.max_in_flight {
        builder = builder.max_in_flight(max);
    }
    let runner = builder.spawn()?;

    let selector = if runner.with_vm(|vm| vm.stream_count(StreamKind::GpuCompute)) > 0 {
        StreamSelector::gpu(0)
    } else {
        StreamSelector::cpu(0)
    };
    let items = Arc::new(Mutex::new(Vec::new()));

    let mut pipeline = Pipeline::new();
    let produce = pipeline.add_actor(
        "produce",
        Produce {
            next: 0,
            limit: options.items,
        },
    );
    let transform = pipeline.add_actor(
        "transform",
        Transform {
            selector,
            factor: options.factor,
        },
    );
    let consume = pipeline.add_actor("consume", Consume(Arc::clone(&items)));
    pipeline.add_output(produce, RegisterDesc::new("out", options.slots, 8))?;
    pipeline.add_output(transform, RegisterDesc::new("out", options.slots, 8))?;
    pipeline.connect(produce, "out", transform, "in")?;
    pipeline.connect(transform, "out", consume, "in")?;

    info!(items = options.items, transform = %selector.kind, "Running pipeline");
    let start = Instant::now();
    runner.with_vm(|vm| pipeline.run_to_completion(vm))?;
    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

    let metrics = runner.metrics();
    runner.shutdown()?;

    let items = items.lock().clone();
    Ok(RunReport {
        transform_stream: StreamId::new(selector.kind, selector.device_id).to_string(),
        items,
        elapsed_ms,
        actors: pipeline.stats(),
        metrics,
    })
}

/// Execute the run command.
pub async fn execute(
    config_path: Option<&str>,
    options: RunOptions,
    format: &str,
) -> CliResult<()> {
    let format: OutputFormat = format.parse()?;
    let config = load_config(config_path)?;
    let report = run_pipeline(config, &options)?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => print_report(&report),
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    println!(
        "{} {} items through {} in {:.2} ms",
        "Processed".green().bold(),
        report.items.len(),
        report.transform_stream.bright_white(),
        report.elapsed_ms
    );
    let shown: Vec<String> = report.items.iter().take(16).map(|v| v.to_string()).collect();
    let more = if report.items.len() > 16 { ", ..." } else { "" };
    println!("  items: [{}{}]", shown.join(", "), more);

    println!("\n{}", "Actors".bold());
    for (name, stats) in &report.actors {
        println!(
            "  {:<10} acts={:<5} read_stalls={:<5} write_stalls={:<5} {}",
            name.bright_white(),
            stats.acts,
            stats.read_stalls,
            stats.write_stalls,
            stats.state.to_string().dimmed()
        );
    }

    println!("\n{}", "Virtual machine".bold());
    println!("{}", report.metrics);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(items: u64, gpu: Option<usize>) -> RunOptions {
        RunOptions {
            items,
            factor: 2,
            slots: 1,
            gpu,
            max_in_flight: None,
        }
    }

    #[test]
    fn test_run_on_cpu() {
        let report = run_pipeline(VmConfig::cpu_only(), &options(6, None)).unwrap();
        assert_eq!(report.transform_stream, "cpu:0");
        assert_eq!(report.items, vec![0, 2, 4, 6, 8, 10]);
        assert_eq!(report.metrics.live_instructions, 0);
    }

    #[test]
    fn test_run_on_accelerator() {
        let report = run_pipeline(VmConfig::cpu_only(), &options(4, Some(1))).unwrap();
        assert_eq!(report.transform_stream, "gpu-compute:0");
        assert_eq!(report.items, vec![0, 2, 4, 6]);
        assert!(report.actors.iter().all(|(_, s)| s.state == ActorState::Done));
    }

    #[test]
    fn test_report_serializes() {
        let report = run_pipeline(VmConfig::cpu_only(), &options(2, None)).unwrap();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["items"], serde_json::json!([0, 2]));
        assert!(json["metrics"]["streams"].is_array());
    }
}
