use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use core::time::Duration;
use microdb::{pipeline::PipelineConfig, server::ServerConfig};
use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
};

/// Command-line entry point for the `microdb` binary.
///
/// Every option can also be set through the environment variable named in
/// its help text, and a `.env` file in the working directory is loaded
/// before parsing.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "microdb",
    version,
    about = "A transactional CSV record server and a parallel record generator"
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Serve the line protocol (BEGIN/COMMIT/SELECT/INSERT/UPDATE/DELETE)
    /// over TCP.
    Serve(ServeArgs),
    /// Generate records with parallel workers into a fresh CSV file.
    Generate(GenerateArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// IP address to listen on.
    ///
    /// Environment variable: `MICRODB_IP`
    #[arg(long, env = "MICRODB_IP", default_value_t = String::from("127.0.0.1"))]
    pub ip: String,

    /// TCP port to listen on.
    ///
    /// Environment variable: `MICRODB_PORT`
    #[arg(long, env = "MICRODB_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Sessions served at the same time. Further clients wait until one
    /// disconnects.
    ///
    /// Environment variable: `MAX_CONCURRENT`
    #[arg(long, env = "MAX_CONCURRENT", default_value_t = 5)]
    pub max_concurrent: usize,

    /// Pending connections the kernel queues ahead of admission. Clients
    /// beyond it are refused.
    ///
    /// Environment variable: `BACKLOG`
    #[arg(long, env = "BACKLOG", default_value_t = 5)]
    pub backlog: u32,

    /// CSV file backing the server. Created with an
    /// `ID,Product,Quantity,Price` header if missing.
    ///
    /// Environment variable: `MICRODB_STORE`
    #[arg(long, env = "MICRODB_STORE", default_value = "registros_generados.csv")]
    pub store: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct GenerateArgs {
    /// Number of generator workers.
    ///
    /// Environment variable: `NUM_WORKERS`
    #[arg(long, env = "NUM_WORKERS")]
    pub workers: usize,

    /// Records to generate. IDs run from 1 to this value.
    ///
    /// Environment variable: `TOTAL_RECORDS`
    #[arg(long, env = "TOTAL_RECORDS")]
    pub total: u64,

    /// Output CSV file. Truncated if it exists.
    ///
    /// Environment variable: `OUTPUT_PATH`
    #[arg(long, env = "OUTPUT_PATH", default_value = "registros_generados.csv")]
    pub output: PathBuf,

    /// IDs handed to a worker per allocation request.
    ///
    /// Environment variable: `ID_BATCH`
    #[arg(long, env = "ID_BATCH", default_value_t = 10)]
    pub batch: u64,

    /// How often, in milliseconds, a blocked worker checks for Ctrl+C.
    ///
    /// Environment variable: `POLL_INTERVAL_MS`
    #[arg(long, env = "POLL_INTERVAL_MS", default_value_t = 100)]
    pub poll_interval_ms: u64,
}

impl TryFrom<ServeArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self, Self::Error> {
        if args.port == 0 {
            bail!("MICRODB_PORT must be between 1 and 65535");
        }
        if args.max_concurrent == 0 {
            bail!("MAX_CONCURRENT must be greater than 0");
        }

        let ip: IpAddr = args
            .ip
            .parse()
            .with_context(|| format!("MICRODB_IP ({}) is not an IP address", args.ip))?;

        Ok(Self::new(SocketAddr::new(ip, args.port), args.store)
            .with_max_concurrent(args.max_concurrent)
            .with_backlog(args.backlog))
    }
}

#[derive(Debug, Clone)]
pub struct GenerateConfig {
    pub pipeline: PipelineConfig,
    pub output: PathBuf,
}

impl TryFrom<GenerateArgs> for GenerateConfig {
    type Error = anyhow::Error;

    fn try_from(args: GenerateArgs) -> Result<Self, Self::Error> {
        if args.workers == 0 {
            bail!("NUM_WORKERS must be greater than 0");
        }
        if args.total == 0 {
            bail!("TOTAL_RECORDS must be greater than 0");
        }
        if args.batch == 0 {
            bail!("ID_BATCH must be greater than 0");
        }
        if args.poll_interval_ms == 0 {
            bail!("POLL_INTERVAL_MS must be greater than 0");
        }

        let pipeline = PipelineConfig::new(args.workers, args.total)
            .with_batch(args.batch)
            .with_poll_interval(Duration::from_millis(args.poll_interval_ms));

        Ok(Self {
            pipeline,
            output: args.output,
        })
    }
}
