//! `streamvm streams` command - Show the streams a resource description yields.

use colored::Colorize;
use serde::Serialize;
use streamvm::config::Resource;
use streamvm::stream_type::{LaunchPolicy, StreamTypeRegistry};

use super::{load_config, OutputFormat};
use crate::error::CliResult;

/// One row of the layout report.
#[derive(Debug, Clone, Serialize)]
pub struct StreamRow {
    /// Stream kind.
    pub kind: String,
    /// Number of streams of that kind.
    pub streams: usize,
    /// Whether dispatch returns before the work completes.
    pub asynchronous: bool,
}

/// Compute the layout for a resource description.
pub fn layout(resource: &Resource) -> Vec<StreamRow> {
    StreamTypeRegistry::new()
        .discover(resource)
        .into_iter()
        .map(|desc| StreamRow {
            kind: desc.stream_type.kind().to_string(),
            streams: desc.num_streams,
            asynchronous: desc.stream_type.kind().launch_policy() == LaunchPolicy::Asynchronous,
        })
        .collect()
}

/// Execute the streams command.
pub async fn execute(
    config_path: Option<&str>,
    cpu: Option<usize>,
    gpu: Option<usize>,
    net: Option<usize>,
    format: &str,
) -> CliResult<()> {
    let format: OutputFormat = format.parse()?;
    let mut resource = load_config(config_path)?.resource;
    if let Some(cpu) = cpu {
        resource.cpu_device_num = cpu;
    }
    if let Some(gpu) = gpu {
        resource.gpu_device_num = gpu;
    }
    if let Some(net) = net {
        resource.comm_net_worker_num = net;
    }

    let rows = layout(&resource);
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
        OutputFormat::Text => {
            println!("{}", "Stream layout".bold());
            if rows.is_empty() {
                println!("  {}", "no streams provisioned".yellow());
            }
            for row in &rows {
                let policy = if row.asynchronous { "async" } else { "sync" };
                println!(
                    "  {:<14} {:>3}  {}",
                    row.kind.bright_white(),
                    row.streams.to_string().bright_cyan(),
                    policy.dimmed()
                );
            }
            let total: usize = rows.iter().map(|r| r.streams).sum();
            println!("  {} {}", "total".dimmed(), total);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_skips_empty_kinds() {
        let rows = layout(&Resource::new().with_cpu_device_num(2));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].kind, "cpu");
        assert_eq!(rows[0].streams, 2);
        assert!(!rows[0].asynchronous);
    }

    #[test]
    fn test_layout_with_accelerators() {
        let rows = layout(&Resource::new().with_gpu_device_num(2).with_comm_net_worker_num(1));
        let kinds: Vec<&str> = rows.iter().map(|r| r.kind.as_str()).collect();
        assert!(kinds.contains(&"gpu-compute"));
        assert!(kinds.contains(&"gpu-copy-h2d"));
        assert!(kinds.contains(&"network"));
        assert!(rows
            .iter()
            .filter(|r| r.kind.starts_with("gpu"))
            .all(|r| r.streams == 2 && r.asynchronous));
    }
}
