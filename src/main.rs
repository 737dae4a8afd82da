use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use hickory_proto::rr::domain::Name;
use hickory_proto::rr::RecordType;

use crate::cancel::CancelToken;
use crate::driver::Resolver;
use crate::hints::RootHints;
use crate::options::ResolverOptions;
use crate::question::Question;

mod cache;
mod cancel;
mod classifier;
mod context;
mod daemon;
mod dnssec;
mod driver;
mod errors;
mod failure;
#[cfg(test)]
mod fake_dispatcher;
mod glue;
mod hints;
mod iterator;
mod macros;
mod options;
mod qmin;
mod question;
mod referral;
mod sanitizer;
mod telemetry;
mod transport;

#[derive(Parser, Debug)]
struct Cli {
    /// Name to resolve; omit when running as a daemon.
    name: Option<Name>,
    #[arg(short = 't', long = "type", default_value = "A")]
    record_type: RecordType,
    /// Validate DNSSEC along the walk.
    #[arg(long)]
    dnssec: bool,
    /// Disable QNAME minimization.
    #[arg(long)]
    no_qname_minimization: bool,
    /// Prefer IPv6 name server addresses.
    #[arg(long)]
    prefer_ipv6: bool,
    /// Randomize the 0x20 case of outgoing query names.
    #[arg(long)]
    randomize_name: bool,
    /// Serve queries over UDP on this port instead of resolving once.
    #[arg(long)]
    daemon: Option<u16>,
    /// Optional named.root style hints file.
    #[arg(long)]
    root_hints: Option<PathBuf>,
    /// Export traces to this OTLP endpoint.
    #[arg(long)]
    otlp: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    telemetry::setup_tracing(args.otlp.as_deref())?;

    let hints = match &args.root_hints {
        Some(path) => RootHints::from_file(path)?,
        None => RootHints::built_in(),
    };
    let options = ResolverOptions {
        dnssec_validation: args.dnssec,
        qname_minimization: !args.no_qname_minimization,
        prefer_ipv6: args.prefer_ipv6,
        randomize_name: args.randomize_name,
        ..Default::default()
    };
    let resolver = Resolver::new().with_hints(hints);

    if let Some(port) = args.daemon {
        return daemon::daemon(resolver, options, port).await;
    }

    let name = args.name.ok_or_else(|| anyhow::anyhow!("a name to resolve is required"))?;
    let question = Question::new(name, args.record_type);
    let response = resolver.resolve(question, &options, &CancelToken::never()).await?;

    for record in response.answers() {
        println!("{record}");
    }
    if response.answers().is_empty() {
        println!("{}", response.response_code());
    }

    Ok(())
}
