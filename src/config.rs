use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use regex::Regex;
use serde::Deserialize;

use crate::router::PoolRule;
use crate::upstream::{Proto, Upstream};

#[derive(Parser, Debug)]
#[command(name = "poolrelay", version, about = "Run the proxy load balancer")]
pub struct Cli {
    /// YAML config file
    #[arg(short, long)]
    pub config: PathBuf,

    /// Override the introspection API bind host
    #[arg(long)]
    pub host: Option<String>,

    /// Override the introspection API bind port
    #[arg(short, long)]
    pub port: Option<u16>,

    #[arg(long, default_value = "info")]
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(rename = "Server")]
    pub server: ServerSection,
    #[serde(rename = "Pools", default)]
    pub pools: Vec<PoolSection>,
    #[serde(rename = "Rules", default)]
    pub rules: Vec<RuleSection>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSection {
    #[serde(rename = "Host", default = "default_bind_host")]
    pub host: String,
    /// Default listener port for rules that name none.
    #[serde(rename = "Port", default)]
    pub port: Option<u16>,
    #[serde(rename = "API_Port", default = "default_api_port")]
    pub api_port: u16,
    #[serde(rename = "Log_Requests", default = "default_log_requests")]
    pub log_requests: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PoolSection {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Proxies", default)]
    pub proxies: Vec<ProxySection>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxySection {
    #[serde(rename = "Host")]
    pub host: String,
    #[serde(rename = "Port", default = "default_proxy_port")]
    pub port: u16,
    #[serde(rename = "User")]
    pub user: Option<String>,
    #[serde(rename = "Pass")]
    pub pass: Option<String>,
    #[serde(rename = "types")]
    pub types: Option<Vec<Proto>>,
    /// Per-operation upstream timeout in seconds.
    #[serde(rename = "Timeout")]
    pub timeout: Option<u64>,
    #[serde(rename = "Verify_TLS", default)]
    pub verify_tls: bool,
    #[serde(rename = "Geo")]
    pub geo: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuleSection {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Port")]
    pub port: Option<u16>,
    #[serde(rename = "Pools", default)]
    pub pools: Vec<String>,
    #[serde(rename = "Domains", default)]
    pub domains: Vec<String>,
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8181
}

fn default_log_requests() -> bool {
    true
}

fn default_proxy_port() -> u16 {
    80
}

pub fn load_config() -> Result<(Cli, Config)> {
    let cli = Cli::parse();

    let yaml = fs::read_to_string(&cli.config)
        .with_context(|| format!("Failed to read {}", cli.config.display()))?;
    let cfg = parse_config(&yaml)?;
    Ok((cli, cfg))
}

pub fn parse_config(yaml: &str) -> Result<Config> {
    serde_yaml::from_str(yaml).context("Failed to parse the YAML config")
}

/// Pool name -> endpoints. A proxy listed under two pools becomes two
/// endpoint objects, exactly as two config entries would.
pub fn build_registry(cfg: &Config) -> HashMap<String, Vec<Arc<Upstream>>> {
    let mut pools = HashMap::new();
    for pool in &cfg.pools {
        let proxies = pool
            .proxies
            .iter()
            .map(|p| {
                let mut upstream = Upstream::new(p.host.clone(), p.port);
                if p.user.is_some() || p.pass.is_some() {
                    upstream = upstream.credentials(
                        p.user.as_deref().unwrap_or_default(),
                        p.pass.as_deref().unwrap_or_default(),
                    );
                }
                if let Some(types) = &p.types {
                    upstream = upstream.types(types.iter().copied());
                }
                if let Some(secs) = p.timeout {
                    upstream = upstream.timeout(Duration::from_secs(secs));
                }
                if let Some(geo) = &p.geo {
                    upstream = upstream.geo_code(geo.clone());
                }
                Arc::new(upstream.verify_tls(p.verify_tls))
            })
            .collect();
        pools.insert(pool.name.clone(), proxies);
    }
    pools
}

/// Materialize one `PoolRule` per rule x domain pattern. The rank keeps
/// rule order in the integer part and pattern order in the fraction.
pub fn build_rules(cfg: &Config) -> Result<Vec<PoolRule>> {
    let mut rules = Vec::new();
    for (rule_index, rule) in cfg.rules.iter().enumerate() {
        let port = rule.port.or(cfg.server.port).with_context(|| {
            format!("rule {:?} names no Port and Server.Port is unset", rule.name)
        })?;
        let pool_set = rule.pools.join(",");
        for (domain_index, domain) in rule.domains.iter().enumerate() {
            let pattern = Regex::new(domain)
                .with_context(|| format!("rule {:?}: bad pattern {:?}", rule.name, domain))?;
            let rank = rule_index as f64 + domain_index as f64 / 100.0;
            rules.push(PoolRule::new(
                pool_set.clone(),
                port,
                rank,
                rule.name.clone(),
                pattern,
            ));
        }
    }
    Ok(rules)
}
