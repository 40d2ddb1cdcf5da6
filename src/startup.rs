use anyhow::{Context, Result};
use std::time::Duration;

use crate::config::Config;
use crate::ports::{EventBus, TransactionStore};

const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ValidationReport {
    pub environment: bool,
    pub store: bool,
    pub bus: bool,
    pub errors: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.environment && self.store && self.bus
    }

    pub fn print(&self) {
        println!("\n=== Startup Validation Report ===");
        println!("Configuration:          {}", status(self.environment));
        println!("Transaction Store:      {}", status(self.store));
        println!("Event Bus:              {}", status(self.bus));

        if !self.errors.is_empty() {
            println!("\nErrors:");
            for error in &self.errors {
                println!("  ❌ {}", error);
            }
        }

        println!("\nOverall Status: {}", if self.is_valid() { "✅ PASS" } else { "❌ FAIL" });
        println!("=================================\n");
    }
}

fn status(ok: bool) -> &'static str {
    if ok { "✅ OK" } else { "❌ FAIL" }
}

/// Checks the configuration and the reachability of the wired store and bus.
pub async fn validate_environment(
    config: &Config,
    store: &dyn TransactionStore,
    bus: &dyn EventBus,
) -> ValidationReport {
    let mut report = ValidationReport {
        environment: true,
        store: true,
        bus: true,
        errors: Vec::new(),
    };

    if let Err(e) = config.validate() {
        report.environment = false;
        report.errors.push(format!("Configuration: {}", e));
    }

    if let Err(e) = validate_store(store).await {
        report.store = false;
        report.errors.push(format!("Store: {:#}", e));
    }

    if let Err(e) = validate_bus(bus).await {
        report.bus = false;
        report.errors.push(format!("Bus: {:#}", e));
    }

    report
}

async fn validate_store(store: &dyn TransactionStore) -> Result<()> {
    tokio::time::timeout(CHECK_TIMEOUT, store.ping())
        .await
        .context("Store ping timed out")?
        .context("Store ping failed")
}

async fn validate_bus(bus: &dyn EventBus) -> Result<()> {
    tokio::time::timeout(CHECK_TIMEOUT, bus.ping())
        .await
        .context("Bus ping timed out")?
        .context("Bus ping failed")
}
