// Property Research Workers
// Built-in catalog that assembles a property dossier from records, valuation, owner and LLM services

use crate::config::EngineConfig;
use crate::error::{ServiceError, ServiceResult};
use crate::execution::context::ContextView;
use crate::providers::{Provider, ProviderRequest, ProviderSet};
use crate::registry::{WorkerRegistry, WorkerSpec};
use crate::retry::RetryPolicy;
use crate::workers::{Worker, WorkerError, WorkerOutput};

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Provider names the catalog expects in its [`ProviderSet`]
pub const PROVIDER_NAMES: [&str; 4] = ["records", "valuation", "owners", "llm"];

/// Seed key carrying the street address
pub const ADDRESS_KEY: &str = "address";

pub const PROPERTY_DETAILS: &str = "property.details";
pub const PROPERTY_VALUATION: &str = "property.valuation";
pub const OWNER_CONTACT: &str = "owner.contact";
pub const MARKET_COMPARABLES: &str = "market.comparables";
pub const MARKET_SUMMARY: &str = "market.summary";
pub const DOSSIER_REPORT: &str = "dossier.report";

/// Specs for the built-in workers, with default timeouts and retry policies
pub fn builtin_specs() -> Vec<WorkerSpec> {
    let transient = RetryPolicy::exponential(2, Duration::from_millis(500), Duration::from_secs(4));

    vec![
        WorkerSpec::new("property_details")
            .describe("Fetch the property record for the seeded address")
            .outputs([PROPERTY_DETAILS])
            .timeout(Duration::from_secs(15))
            .retry(transient.clone()),
        WorkerSpec::new("valuation")
            .describe("Estimate current market value")
            .depends_on(["property_details"])
            .outputs([PROPERTY_VALUATION])
            .timeout(Duration::from_secs(20))
            .retry(transient.clone()),
        WorkerSpec::new("owner_lookup")
            .describe("Find owner contact details")
            .depends_on(["property_details"])
            .outputs([OWNER_CONTACT])
            .timeout(Duration::from_secs(20))
            .retry(transient.clone())
            .optional(),
        WorkerSpec::new("comparable_sales")
            .describe("Collect recent nearby sales")
            .depends_on(["property_details"])
            .outputs([MARKET_COMPARABLES])
            .timeout(Duration::from_secs(20))
            .retry(transient.clone()),
        WorkerSpec::new("market_summary")
            .describe("Summarize valuation and comparables in prose")
            .depends_on(["valuation", "comparable_sales"])
            .outputs([MARKET_SUMMARY])
            .timeout(Duration::from_secs(60))
            .retry(transient),
        WorkerSpec::new("dossier")
            .describe("Assemble the final research dossier")
            .depends_on(["valuation", "owner_lookup", "market_summary"])
            .outputs([DOSSIER_REPORT])
            .timeout(Duration::from_secs(5)),
    ]
}

/// Registry of the built-in workers bound to `providers`, with `config` overrides applied
pub fn builtin_registry(providers: &ProviderSet, config: &EngineConfig) -> ServiceResult<WorkerRegistry> {
    let specs = config.apply_overrides(builtin_specs())?;

    let mut entries = Vec::with_capacity(specs.len());
    for spec in specs {
        let worker = build_worker(&spec.name, providers)?;
        entries.push((spec, worker));
    }

    let mut registry = WorkerRegistry::new();
    registry.register_all(entries)?;
    Ok(registry)
}

fn build_worker(name: &str, providers: &ProviderSet) -> ServiceResult<Arc<dyn Worker>> {
    let worker: Arc<dyn Worker> = match name {
        "property_details" => Arc::new(PropertyDetailsWorker {
            records: require(providers, "records", name)?,
        }),
        "valuation" => Arc::new(ValuationWorker {
            valuation: require(providers, "valuation", name)?,
        }),
        "owner_lookup" => Arc::new(OwnerLookupWorker {
            owners: require(providers, "owners", name)?,
        }),
        "comparable_sales" => Arc::new(ComparableSalesWorker {
            records: require(providers, "records", name)?,
        }),
        "market_summary" => Arc::new(MarketSummaryWorker {
            llm: require(providers, "llm", name)?,
        }),
        "dossier" => Arc::new(DossierWorker),
        other => {
            return Err(ServiceError::Config(format!(
                "no implementation for worker '{}'",
                other
            )))
        }
    };
    Ok(worker)
}

fn require(providers: &ProviderSet, provider: &str, worker: &str) -> ServiceResult<Arc<dyn Provider>> {
    providers.get(provider).ok_or_else(|| {
        ServiceError::Config(format!(
            "worker '{}' needs provider '{}' which is not configured",
            worker, provider
        ))
    })
}

async fn call(provider: &Arc<dyn Provider>, operation: &str, params: Value) -> Result<Value, WorkerError> {
    let response = provider
        .call(ProviderRequest::new(operation, params))
        .await?;
    debug!(
        provider = provider.name(),
        operation,
        attempts = response.metadata.attempts,
        latency_ms = response.metadata.latency.as_millis() as u64,
        "provider call finished"
    );
    Ok(response.body)
}

fn single(key: &str, value: Value) -> WorkerOutput {
    let mut output = WorkerOutput::new();
    output.insert(key.to_string(), value);
    output
}

struct PropertyDetailsWorker {
    records: Arc<dyn Provider>,
}

#[async_trait::async_trait]
impl Worker for PropertyDetailsWorker {
    async fn run(&self, entity_id: &str, context: &ContextView) -> Result<WorkerOutput, WorkerError> {
        let address = context
            .read_optional(ADDRESS_KEY)?
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|address| !address.is_empty())
            .ok_or_else(|| WorkerError::validation("seed key 'address' is missing or empty"))?;

        let details = call(
            &self.records,
            "property.details",
            json!({ "entity_id": entity_id, "address": address }),
        )
        .await?;
        if !details.is_object() {
            return Err(WorkerError::validation("property record is not an object"));
        }
        Ok(single(PROPERTY_DETAILS, details))
    }
}

struct ValuationWorker {
    valuation: Arc<dyn Provider>,
}

#[async_trait::async_trait]
impl Worker for ValuationWorker {
    async fn run(&self, entity_id: &str, context: &ContextView) -> Result<WorkerOutput, WorkerError> {
        let details = context.read(PROPERTY_DETAILS)?;
        let estimate = call(
            &self.valuation,
            "valuation.estimate",
            json!({ "entity_id": entity_id, "property": details }),
        )
        .await?;
        Ok(single(PROPERTY_VALUATION, estimate))
    }
}

struct OwnerLookupWorker {
    owners: Arc<dyn Provider>,
}

#[async_trait::async_trait]
impl Worker for OwnerLookupWorker {
    async fn run(&self, entity_id: &str, context: &ContextView) -> Result<WorkerOutput, WorkerError> {
        let details = context.read(PROPERTY_DETAILS)?;
        let contact = call(
            &self.owners,
            "owner.lookup",
            json!({ "entity_id": entity_id, "property": details }),
        )
        .await?;
        Ok(single(OWNER_CONTACT, contact))
    }
}

struct ComparableSalesWorker {
    records: Arc<dyn Provider>,
}

#[async_trait::async_trait]
impl Worker for ComparableSalesWorker {
    async fn run(&self, entity_id: &str, context: &ContextView) -> Result<WorkerOutput, WorkerError> {
        let details = context.read(PROPERTY_DETAILS)?;
        let body = call(
            &self.records,
            "sales.comparables",
            json!({ "entity_id": entity_id, "property": details, "limit": 10 }),
        )
        .await?;

        // Accept either a bare list or {"sales": [...]}
        let sales = match body {
            Value::Array(items) => Value::Array(items),
            Value::Object(mut map) => map.remove("sales").unwrap_or(Value::Null),
            _ => Value::Null,
        };
        if !sales.is_array() {
            return Err(WorkerError::validation("comparable sales response has no list of sales"));
        }
        Ok(single(MARKET_COMPARABLES, sales))
    }
}

struct MarketSummaryWorker {
    llm: Arc<dyn Provider>,
}

impl MarketSummaryWorker {
    fn prompt(entity_id: &str, valuation: &Value, comparables: &Value) -> String {
        let count = comparables.as_array().map(Vec::len).unwrap_or(0);
        format!(
            "Write a short market summary for property {}.\nValuation: {}\nComparable sales ({}): {}",
            entity_id, valuation, count, comparables
        )
    }
}

#[async_trait::async_trait]
impl Worker for MarketSummaryWorker {
    async fn run(&self, entity_id: &str, context: &ContextView) -> Result<WorkerOutput, WorkerError> {
        let valuation = context.read(PROPERTY_VALUATION)?;
        let comparables = context.read(MARKET_COMPARABLES)?;

        let body = call(
            &self.llm,
            "text.generate",
            json!({
                "prompt": Self::prompt(entity_id, valuation, comparables),
                "max_tokens": 400,
            }),
        )
        .await?;

        let text = body
            .get("text")
            .and_then(Value::as_str)
            .ok_or_else(|| WorkerError::external("text generation response has no 'text' field"))?;
        Ok(single(MARKET_SUMMARY, Value::String(text.trim().to_string())))
    }
}

/// Pure assembly step; owner contact is optional
struct DossierWorker;

#[async_trait::async_trait]
impl Worker for DossierWorker {
    async fn run(&self, entity_id: &str, context: &ContextView) -> Result<WorkerOutput, WorkerError> {
        let valuation = context.read(PROPERTY_VALUATION)?;
        let summary = context.read(MARKET_SUMMARY)?;
        let owner = context.read_optional(OWNER_CONTACT)?;

        let mut missing = Vec::new();
        if owner.is_none() {
            missing.push("owner");
        }

        let report = json!({
            "entity_id": entity_id,
            "valuation": valuation,
            "market_summary": summary,
            "owner": owner.cloned().unwrap_or(Value::Null),
            "missing_sections": missing,
        });
        Ok(single(DOSSIER_REPORT, report))
    }
}
