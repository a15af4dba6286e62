use crate::output;

use color_eyre::Result;
use dossier_service::{Backoff, EngineConfig, RetryPolicy};

use super::catalog_registry;

pub fn execute(config: &EngineConfig) -> Result<()> {
    let registry = catalog_registry(config)?;

    output::header(&format!("{} workers registered", registry.len()));
    for spec in registry.specs() {
        let optional = if spec.optional { " (optional)" } else { "" };
        println!("{}{}", spec.name, optional);
        if !spec.description.is_empty() {
            println!("    {}", spec.description);
        }
        if !spec.dependencies.is_empty() {
            println!("    depends on: {}", spec.dependencies.join(", "));
        }
        println!("    outputs:    {}", spec.outputs.join(", "));
        println!("    timeout:    {:.1}s", spec.timeout.as_secs_f64());
        println!("    retry:      {}", describe_retry(&spec.retry));
    }

    Ok(())
}

fn describe_retry(policy: &RetryPolicy) -> String {
    if policy.attempts() <= 1 {
        return "none".to_string();
    }
    let backoff = match &policy.backoff {
        Backoff::None => "immediately".to_string(),
        Backoff::Fixed { delay_ms } => format!("every {}ms", delay_ms),
        Backoff::Exponential {
            initial_ms,
            multiplier,
            max_ms,
        } => format!("{}ms x{} up to {}ms", initial_ms, multiplier, max_ms),
    };
    format!("{} attempts, {}", policy.attempts(), backoff)
}
