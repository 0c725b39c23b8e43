mod format;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;

use kestrel_cluster::{
    execute_plan, BarrierLock, CombineType, ExecNodes, LocalGtm, PlanNode, RemoteStep,
    SessionContext, SortKey, TcpPoolManager, TwoPhaseCoordinator,
};
use kestrel_common::config::{DataNodeConfig, KestrelConfig};
use kestrel_common::types::NodeId;

#[derive(Parser, Debug)]
#[command(name = "kestrel", about = "Kestrel coordinator: run SQL across data nodes", version)]
struct Cli {
    /// Config file path.
    #[arg(long, default_value = "kestrel.toml")]
    config: String,

    /// Print the default configuration as TOML and exit.
    #[arg(long)]
    print_default_config: bool,

    /// Statement to run on the data nodes.
    #[arg(short = 'c', long = "execute")]
    execute: Option<String>,

    /// Data node ids to run on (default: every configured node).
    #[arg(long, value_delimiter = ',')]
    on: Vec<u32>,

    /// Add or replace a data node: ID=HOST:PORT.
    #[arg(long = "node", value_name = "ID=HOST:PORT", value_parser = parse_node)]
    nodes: Vec<DataNodeConfig>,

    /// Treat the statement as a write and sum affected rows.
    #[arg(long)]
    write: bool,

    /// Merge node results ordered by this zero-based column.
    #[arg(long)]
    order_by: Option<usize>,

    /// Roll the transaction back instead of committing it.
    #[arg(long)]
    rollback: bool,

    /// Metrics listen address (overrides config).
    #[arg(long)]
    metrics_addr: Option<String>,

    /// Disable two-phase commit (overrides config).
    #[arg(long)]
    no_two_phase: bool,
}

fn parse_node(s: &str) -> Result<DataNodeConfig, String> {
    let (id, addr) = s
        .split_once('=')
        .ok_or_else(|| format!("expected ID=HOST:PORT, got '{}'", s))?;
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| format!("expected HOST:PORT, got '{}'", addr))?;
    let id: u32 = id.parse().map_err(|e| format!("bad node id '{}': {}", id, e))?;
    let port: u16 = port.parse().map_err(|e| format!("bad port '{}': {}", port, e))?;
    Ok(DataNodeConfig {
        id,
        name: format!("dn{}", id),
        host: host.to_string(),
        port,
        primary: false,
        preferred: false,
    })
}

fn load_config(path: &str) -> Result<KestrelConfig> {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let config = toml::from_str(&content).with_context(|| format!("parsing {}", path))?;
            tracing::info!("Loaded config from {}", path);
            Ok(config)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!("Config file {} not found, using defaults", path);
            Ok(KestrelConfig::default())
        }
        Err(e) => Err(e).with_context(|| format!("reading {}", path)),
    }
}

fn apply_overrides(config: &mut KestrelConfig, cli: &Cli) {
    for node in &cli.nodes {
        config.nodes.retain(|n| n.id != node.id);
        config.nodes.push(node.clone());
    }
    config.nodes.sort_by_key(|n| n.id);
    if let Some(ref addr) = cli.metrics_addr {
        config.coordinator.metrics_listen_addr = addr.clone();
    }
    if cli.no_two_phase {
        config.txn.enforce_two_phase = false;
    }
}

fn build_plan(cli: &Cli, sql: &str, targets: Vec<NodeId>) -> PlanNode {
    let mut step = RemoteStep::new(sql, ExecNodes::all_of(targets));
    if cli.write {
        step = step.write(CombineType::Sum);
    }
    if let Some(col) = cli.order_by {
        step = step.sorted_by(vec![SortKey::asc(col)]);
    }
    PlanNode::RemoteQuery(step)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.print_default_config {
        let toml_str = toml::to_string_pretty(&KestrelConfig::default())
            .unwrap_or_else(|e| format!("# failed to serialize default config: {}", e));
        println!("{}", toml_str);
        return Ok(());
    }

    kestrel_observability::init_tracing();

    let mut config = load_config(&cli.config)?;
    apply_overrides(&mut config, &cli);
    if let Err(e) = config.validate() {
        bail!("invalid configuration: {}", e);
    }
    tracing::debug!("Config: {:?}", config);

    if let Err(e) = kestrel_observability::init_metrics(&config.coordinator.metrics_listen_addr) {
        tracing::warn!("Failed to initialize metrics: {}", e);
    }

    let Some(sql) = cli.execute.as_deref() else {
        bail!("nothing to run; pass a statement with -c");
    };
    let targets: Vec<NodeId> = if cli.on.is_empty() {
        config.node_ids()
    } else {
        cli.on.iter().copied().map(NodeId).collect()
    };
    if targets.is_empty() {
        bail!("no data nodes configured");
    }
    for node in &targets {
        if config.node(*node).is_none() {
            bail!("{} is not a configured data node", node);
        }
    }

    let config = Arc::new(config);
    let manager = Arc::new(TcpPoolManager::new(config.clone()));
    let gtm = Arc::new(LocalGtm::new());
    let mut session = SessionContext::new(config.clone(), manager, gtm.clone(), Arc::new(BarrierLock::new()));
    let coordinator = TwoPhaseCoordinator::from_config(&config);

    let plan = build_plan(&cli, sql, targets);
    let result = match execute_plan(&mut session, &plan).await {
        Ok(result) => result,
        Err(e) => {
            coordinator.rollback_transaction(&mut session).await;
            return Err(e).context("statement failed");
        }
    };
    print!("{}", format::render(&result));

    if cli.rollback {
        let status = coordinator.rollback_transaction(&mut session).await;
        tracing::info!(status = status.as_str(), "transaction rolled back");
        return Ok(());
    }
    let status = coordinator
        .commit_transaction(&mut session)
        .await
        .context("commit failed")?;
    tracing::info!(status = status.as_str(), "transaction committed");
    for txn in gtm.list_in_doubt() {
        tracing::warn!(gid = %txn.gid, nodes = ?txn.nodes, "transaction left in doubt");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_node() {
        let node = parse_node("3=10.0.0.7:5433").unwrap();
        assert_eq!(node.id, 3);
        assert_eq!(node.name, "dn3");
        assert_eq!(node.address(), "10.0.0.7:5433");
        assert!(parse_node("3").is_err());
        assert!(parse_node("x=host:1").is_err());
    }

    #[test]
    fn test_overrides_replace_nodes() {
        let cli = Cli::parse_from([
            "kestrel",
            "--node",
            "1=a:1000",
            "--node",
            "1=b:2000",
            "--no-two-phase",
            "-c",
            "SELECT 1",
        ]);
        let mut config = KestrelConfig::default();
        apply_overrides(&mut config, &cli);
        assert_eq!(config.nodes.len(), 1);
        assert_eq!(config.nodes[0].address(), "b:2000");
        assert!(!config.txn.enforce_two_phase);
    }

    #[test]
    fn test_write_plan_sums() {
        let cli = Cli::parse_from(["kestrel", "--write", "--order-by", "0", "-c", "x"]);
        let PlanNode::RemoteQuery(step) = build_plan(&cli, "x", vec![NodeId(1)]) else {
            panic!("expected a remote query");
        };
        assert!(step.is_write);
        assert_eq!(step.combine, CombineType::Sum);
        assert_eq!(step.sort, Some(vec![SortKey::asc(0)]));
    }
}
