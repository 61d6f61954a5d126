use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use stampede::analyse::AnalyseResult;
use stampede::errors::EngineError;
use stampede::job::JobContainer;
use stampede::launcher::Launcher;
use stampede::master::Master;
use stampede::net::HttpMethod;
use stampede::settings::Settings;
use stampede::slave::Slave;

/// Distributed HTTP/WebSocket load generation engine.
#[derive(Parser, Debug)]
#[command(name = "stampede", version, about)]
struct Args {
    /// Worker count per node; defaults to the number of CPUs.
    #[arg(short, long)]
    worker: Option<usize>,

    /// Test duration in seconds; defaults to TEST_DURATION.
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Request method: HttpGet or HttpPost.
    #[arg(short, long, default_value = "HttpGet")]
    method: String,

    /// Target URL; repeat the flag for multiple endpoints. HttpPost
    /// turns the query string into a JSON body.
    #[arg(short, long = "path")]
    path: Vec<String>,

    /// Process role: `local` runs master and one node in this process,
    /// `master` waits for the SLAVES to register, `slave` joins MASTER.
    #[arg(long, default_value = "local")]
    role: String,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let settings = Settings::from_env();
    match run(args, settings) {
        Ok(Some(result)) => println!("{}", result),
        Ok(None) => {}
        Err(e) => {
            eprintln!("error: {}", e);
            std::process::exit(1);
        }
    }
}

fn run(args: Args, settings: Settings) -> Result<Option<AnalyseResult>, EngineError> {
    match args.role.as_str() {
        "slave" => {
            let runtime = tokio::runtime::Runtime::new()?;
            let mut slave = Slave::new(settings);
            runtime.block_on(slave.run())?;
            Ok(None)
        }
        "master" => {
            let duration = args.timeout.unwrap_or(settings.test_duration);
            let jobs = parse_jobs(&args)?;
            let mut master = Master::new(settings, args.worker);
            master.dispatch(jobs);
            master.start()?;
            std::thread::sleep(Duration::from_secs(duration));
            Ok(Some(master.stop()?))
        }
        "local" => {
            let duration = args.timeout.unwrap_or(settings.test_duration);
            let jobs = parse_jobs(&args)?;
            let mut launcher =
                Launcher::new(settings, args.worker, Duration::from_secs(duration));
            for job in jobs {
                launcher.dispatch(job);
            }
            Ok(Some(launcher.launch()?))
        }
        other => Err(EngineError::BadMessage(format!(
            "unknown role '{}'; use local, master or slave",
            other
        ))),
    }
}

fn parse_jobs(args: &Args) -> Result<Vec<JobContainer>, EngineError> {
    let method: HttpMethod = args
        .method
        .parse()
        .map_err(EngineError::BadMessage)?;
    if args.path.is_empty() {
        return Err(EngineError::BadMessage(
            "at least one --path is required".to_string(),
        ));
    }
    args.path
        .iter()
        .map(|url| JobContainer::from_url(url, method))
        .collect()
}
