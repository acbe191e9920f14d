use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use arc_swap::ArcSwap;
use rand::Rng;
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::error::ProxyError;
use crate::upstream::Upstream;

/// One routing rule: a host pattern bound to a listener port and the pools
/// that may serve it.
#[derive(Debug, Clone)]
pub struct PoolRule {
    /// Comma-joined pool names, kept joined the way the rule store writes
    /// them; this string doubles as the telemetry `pool_name`.
    pub pool_set: String,
    pub port: u16,
    /// `rule_index + domain_index / 100`, so rules keep their order and
    /// patterns within a rule keep theirs.
    pub rank: f64,
    pub rule_name: String,
    pub pattern: Regex,
    pub rule_kind: String,
}

impl PoolRule {
    pub fn new(pool_set: impl Into<String>, port: u16, rank: f64, rule_name: impl Into<String>, pattern: Regex) -> Self {
        PoolRule {
            pool_set: pool_set.into(),
            port,
            rank,
            rule_name: rule_name.into(),
            pattern,
            rule_kind: "domain".to_string(),
        }
    }
}

/// An immutable, rank-ordered rule snapshot. Reloads publish a fresh
/// snapshot; in-flight selections keep reading the one they loaded.
#[derive(Debug, Default)]
pub struct RuleTable {
    rules: Vec<PoolRule>,
}

impl RuleTable {
    pub fn new(mut rules: Vec<PoolRule>) -> Self {
        rules.sort_by(|a, b| a.rank.total_cmp(&b.rank));
        RuleTable { rules }
    }

    pub fn rules(&self) -> &[PoolRule] {
        &self.rules
    }
}

/// Pool membership row exposed by the introspection API.
#[derive(Debug, Clone, Serialize)]
pub struct PoolMember {
    pub proxy: String,
    pub pool: String,
}

/// Picks an upstream for a destination host on a listener port: first
/// matching rule wins, then one proxy is sampled uniformly from the winning
/// pools.
pub struct Router {
    pools: HashMap<String, Vec<Arc<Upstream>>>,
    table: ArcSwap<RuleTable>,
}

impl Router {
    pub fn new(pools: HashMap<String, Vec<Arc<Upstream>>>, rules: Vec<PoolRule>) -> Self {
        Router {
            pools,
            table: ArcSwap::from_pointee(RuleTable::new(rules)),
        }
    }

    /// Publish a new rule snapshot.
    pub fn reload(&self, rules: Vec<PoolRule>) {
        self.table.store(Arc::new(RuleTable::new(rules)));
    }

    /// Walk the rules for `listener_port` in ascending rank and return a
    /// uniformly sampled proxy from the first rule whose pattern matches
    /// `host`, together with the winning pool-set label.
    pub fn select(&self, host: &str, listener_port: u16) -> Result<(Arc<Upstream>, String), ProxyError> {
        let table = self.table.load();
        let no_proxy = || ProxyError::NoProxy {
            host: host.to_string(),
            port: listener_port,
        };

        let rule = table
            .rules()
            .iter()
            .filter(|r| r.port == listener_port)
            .find(|r| r.pattern.is_match(host))
            .ok_or_else(no_proxy)?;

        debug!(
            "host {:?} matched rule {:?} (rank {}) -> pools {:?}",
            host, rule.rule_name, rule.rank, rule.pool_set
        );

        let mut candidates: Vec<&Arc<Upstream>> = Vec::new();
        for pool in rule.pool_set.split(',') {
            for proxy in self.pools.get(pool).map(Vec::as_slice).unwrap_or_default() {
                if !candidates.iter().any(|c| Arc::ptr_eq(c, proxy)) {
                    candidates.push(proxy);
                }
            }
        }

        if candidates.is_empty() {
            return Err(no_proxy());
        }
        let pick = rand::rng().random_range(0..candidates.len());
        Ok((candidates[pick].clone(), rule.pool_set.clone()))
    }

    /// Distinct listener ports named by the current rules, ascending.
    pub fn listener_ports(&self) -> Vec<u16> {
        let table = self.table.load();
        let ports: BTreeSet<u16> = table.rules().iter().map(|r| r.port).collect();
        ports.into_iter().collect()
    }

    /// Pool membership listing for the introspection API.
    pub fn memberships(&self) -> Vec<PoolMember> {
        let mut pools: Vec<&String> = self.pools.keys().collect();
        pools.sort();
        pools
            .into_iter()
            .flat_map(|pool| {
                self.pools[pool].iter().map(move |proxy| PoolMember {
                    proxy: proxy.addr(),
                    pool: pool.clone(),
                })
            })
            .collect()
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    pub fn proxy_count(&self) -> usize {
        self.pools.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pools(layout: &[(&str, &[u16])]) -> HashMap<String, Vec<Arc<Upstream>>> {
        layout.iter()
            .map(|(name, ports)| {
                let proxies = ports
                    .iter()
                    .map(|p| Arc::new(Upstream::new("10.0.0.1", *p)))
                    .collect();
                (name.to_string(), proxies)
            })
            .collect()
    }

    fn rule(pool_set: &str, port: u16, rank: f64, pattern: &str) -> PoolRule {
        PoolRule::new(pool_set, port, rank, format!("r{rank}"), Regex::new(pattern).unwrap())
    }

    #[test]
    fn first_matching_rule_wins_by_rank() {
        let router = Router::new(
            pools(&[("a", &[1001]), ("b", &[1002])]),
            vec![
                rule("b", 8080, 1.0, ".*"),
                rule("a", 8080, 0.0, r"example\.com"),
            ],
        );

        let (proxy, pool) = router.select("example.com", 8080).unwrap();
        assert_eq!(pool, "a");
        assert_eq!(proxy.port, 1001);

        let (proxy, pool) = router.select("other.net", 8080).unwrap();
        assert_eq!(pool, "b");
        assert_eq!(proxy.port, 1002);
    }

    #[test]
    fn sub_ranks_order_patterns_within_a_rule() {
        // same rule index, two domain patterns at sub-ranks .00 and .01
        let router = Router::new(
            pools(&[("a", &[1001]), ("b", &[1002])]),
            vec![
                rule("b", 8080, 0.01, ".*"),
                rule("a", 8080, 0.00, r"special"),
            ],
        );
        let (_, pool) = router.select("special.host", 8080).unwrap();
        assert_eq!(pool, "a");
        let (_, pool) = router.select("anything.else", 8080).unwrap();
        assert_eq!(pool, "b");
    }

    #[test]
    fn pattern_search_is_unanchored() {
        let router = Router::new(
            pools(&[("a", &[1001])]),
            vec![rule("a", 8080, 0.0, r"example\.com")],
        );
        assert!(router.select("sub.example.com", 8080).is_ok());
    }

    #[test]
    fn rules_are_scoped_to_their_port() {
        let router = Router::new(
            pools(&[("a", &[1001])]),
            vec![rule("a", 8080, 0.0, ".*")],
        );
        assert!(matches!(
            router.select("example.com", 9090),
            Err(ProxyError::NoProxy { port: 9090, .. })
        ));
    }

    #[test]
    fn no_matching_rule_is_no_proxy() {
        let router = Router::new(
            pools(&[("a", &[1001])]),
            vec![rule("a", 8080, 0.0, r"only\.this")],
        );
        assert!(matches!(
            router.select("unknown.test", 8080),
            Err(ProxyError::NoProxy { .. })
        ));
    }

    #[test]
    fn empty_winning_pool_is_no_proxy() {
        let router = Router::new(
            pools(&[("a", &[])]),
            vec![rule("a", 8080, 0.0, ".*")],
        );
        assert!(matches!(
            router.select("example.com", 8080),
            Err(ProxyError::NoProxy { .. })
        ));
    }

    #[test]
    fn single_proxy_pool_is_deterministic() {
        let router = Router::new(
            pools(&[("a", &[1001])]),
            vec![rule("a", 8080, 0.0, ".*")],
        );
        for _ in 0..10 {
            let (proxy, _) = router.select("x", 8080).unwrap();
            assert_eq!(proxy.port, 1001);
        }
    }

    #[test]
    fn union_of_pools_deduplicates_shared_proxies() {
        let shared = Arc::new(Upstream::new("10.0.0.1", 1001));
        let mut map = HashMap::new();
        map.insert("a".to_string(), vec![shared.clone()]);
        map.insert("b".to_string(), vec![shared.clone()]);
        let router = Router::new(map, vec![rule("a,b", 8080, 0.0, ".*")]);

        let (proxy, pool) = router.select("x", 8080).unwrap();
        assert!(Arc::ptr_eq(&proxy, &shared));
        assert_eq!(pool, "a,b");
    }

    #[test]
    fn reload_publishes_a_new_snapshot() {
        let router = Router::new(
            pools(&[("a", &[1001])]),
            vec![rule("a", 8080, 0.0, ".*")],
        );
        router.reload(vec![rule("a", 9090, 0.0, ".*")]);
        assert!(router.select("x", 8080).is_err());
        assert!(router.select("x", 9090).is_ok());
        assert_eq!(router.listener_ports(), vec![9090]);
    }

    #[test]
    fn sampling_covers_the_pool() {
        let router = Router::new(
            pools(&[("a", &[1001, 1002, 1003])]),
            vec![rule("a", 8080, 0.0, ".*")],
        );
        let mut seen = BTreeSet::new();
        for _ in 0..200 {
            let (proxy, _) = router.select("x", 8080).unwrap();
            seen.insert(proxy.port);
        }
        assert_eq!(seen.len(), 3);
    }
}
