use clap::{CommandFactory, Parser, Subcommand};
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;

const DEFAULT_CONFIG_YAML: &str = include_str!("../config/default.yaml");
const DEFAULT_IMAGE: &str = "registry.git.rwth-aachen.de/david.krach/poremaps:latest";
const CONTAINER_SHELL: &str = "/bin/bash";

#[derive(Parser, Debug)]
#[command(name = "poremaps-launch", version, about = "Poremaps container launcher")]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a new interactive container with the host working directory
    /// mounted at the shared path
    Open { image: Option<String> },
    /// Attach an interactive shell to the running container as the service
    /// account
    Exec { image: Option<String> },
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    Doctor,
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Init,
    Validate,
    Show,
}

#[derive(Debug, Error)]
enum LaunchError {
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("process error: {0}")]
    Process(String),
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
struct Config {
    version: u32,
    image: String,
    container: Container,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
struct Container {
    name: String,
    user: String,
    shared_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: 1,
            image: DEFAULT_IMAGE.to_string(),
            container: Container::default(),
        }
    }
}

impl Default for Container {
    fn default() -> Self {
        Self {
            name: "poremaps".to_string(),
            user: "poremaps".to_string(),
            shared_dir: "/poremaps/shared".to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
}

#[derive(Debug)]
struct Context {
    config_path: PathBuf,
    json: bool,
}

// Docker sessions started here are interactive: stdio is inherited and only
// the exit status comes back.
trait DockerRunner {
    fn run(&self, args: &[String]) -> Result<i32, io::Error>;
}

struct RealDockerRunner;

impl DockerRunner for RealDockerRunner {
    fn run(&self, args: &[String]) -> Result<i32, io::Error> {
        let status = Command::new("docker").args(args).status()?;
        Ok(status
            .code()
            .unwrap_or(if status.success() { 0 } else { 1 }))
    }
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            if err.use_stderr() {
                let _ = err.print();
                eprintln!("{}", Cli::command().render_help());
                std::process::exit(1);
            }
            let _ = err.print();
            std::process::exit(0);
        }
    };
    let ctx = build_context(&cli);
    let runner = RealDockerRunner;

    let result = match cli.command {
        Commands::Open { image } => handle_open(&ctx, image, &runner),
        Commands::Exec { image } => handle_exec(&ctx, image, &runner),
        Commands::Config { command } => handle_config(&ctx, command).map(|()| 0),
        Commands::Doctor => handle_doctor(&ctx).map(|()| 0),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            if ctx.json {
                let payload = JsonResult::<serde_json::Value> {
                    ok: false,
                    result: None,
                    error: Some(err.to_string()),
                };
                let _ = print_json(&payload);
            } else {
                eprintln!("{err}");
            }
            std::process::exit(1);
        }
    }
}

fn build_context(cli: &Cli) -> Context {
    Context {
        config_path: resolve_config_path(cli.config.as_ref()),
        json: cli.json,
    }
}

fn resolve_config_path(override_path: Option<&PathBuf>) -> PathBuf {
    if let Some(path) = override_path {
        return path.clone();
    }
    if let Ok(path) = env::var("POREMAPS_LAUNCH_CONFIG") {
        return PathBuf::from(path);
    }
    let mut base = default_config_dir();
    base.push("config.yaml");
    base
}

fn default_config_dir() -> PathBuf {
    if let Ok(path) = env::var("POREMAPS_LAUNCH_CONFIG_DIR") {
        return PathBuf::from(path);
    }
    let mut base = home_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push(".config");
    base.push("poremaps-launch");
    base
}

fn ensure_parent(path: &Path) -> Result<(), LaunchError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn read_config(path: &Path) -> Result<Config, LaunchError> {
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    if cfg.version != 1 {
        return Err(LaunchError::Config(format!(
            "unsupported config version {}",
            cfg.version
        )));
    }
    Ok(cfg)
}

// A missing config file is not an error: the built-in defaults make
// `open` work on a fresh machine without `config init`.
fn load_config(path: &Path) -> Result<Config, LaunchError> {
    if !path.exists() {
        return Ok(Config::default());
    }
    read_config(path)
}

fn current_uid() -> u32 {
    current_host_id("-u")
}

fn current_primary_gid() -> u32 {
    current_host_id("-g")
}

fn current_host_id(flag: &str) -> u32 {
    #[cfg(unix)]
    {
        let output = Command::new("id").arg(flag).output();
        if let Ok(output) = output {
            if output.status.success() {
                let text = String::from_utf8_lossy(&output.stdout);
                if let Ok(value) = text.trim().parse::<u32>() {
                    return value;
                }
            }
        }
    }
    #[cfg(not(unix))]
    let _ = flag;
    0
}

fn open_args(cfg: &Config, image: &str, host_dir: &Path, uid: u32, gid: u32) -> Vec<String> {
    vec![
        "run".to_string(),
        "-it".to_string(),
        "--name".to_string(),
        cfg.container.name.clone(),
        "-e".to_string(),
        format!("HOST_UID={uid}"),
        "-e".to_string(),
        format!("HOST_GID={gid}"),
        "-v".to_string(),
        format!("{}:{}", host_dir.display(), cfg.container.shared_dir),
        image.to_string(),
    ]
}

fn exec_args(cfg: &Config) -> Vec<String> {
    vec![
        "exec".to_string(),
        "-it".to_string(),
        "-u".to_string(),
        cfg.container.user.clone(),
        cfg.container.name.clone(),
        CONTAINER_SHELL.to_string(),
    ]
}

fn handle_open<R: DockerRunner>(
    ctx: &Context,
    image: Option<String>,
    runner: &R,
) -> Result<i32, LaunchError> {
    let cfg = load_config(&ctx.config_path)?;
    let image = image.unwrap_or_else(|| cfg.image.clone());
    let host_dir = env::current_dir()?;
    println!(
        "starting container {} from {} with {} mounted at {}",
        cfg.container.name,
        image,
        host_dir.display(),
        cfg.container.shared_dir
    );
    let args = open_args(&cfg, &image, &host_dir, current_uid(), current_primary_gid());
    run_docker(runner, &args)
}

fn handle_exec<R: DockerRunner>(
    ctx: &Context,
    image: Option<String>,
    runner: &R,
) -> Result<i32, LaunchError> {
    let cfg = load_config(&ctx.config_path)?;
    // attaches by container name; an image argument is accepted for symmetry
    // with `open` but plays no role here
    let _ = image;
    println!(
        "attaching shell to container {} as {}",
        cfg.container.name, cfg.container.user
    );
    run_docker(runner, &exec_args(&cfg))
}

// Interactive docker sessions inherit the terminal; their exit status becomes
// ours. Docker's own diagnostics (unknown image, name collision, daemon down)
// reach the operator unmodified.
fn run_docker<R: DockerRunner>(runner: &R, args: &[String]) -> Result<i32, LaunchError> {
    runner.run(args).map_err(|err| {
        let rendered = format!("docker {}", args.join(" "));
        if err.kind() == io::ErrorKind::NotFound {
            LaunchError::Process(format!(
                "failed to run `{rendered}`: {err}\nHint: Install Docker and ensure `docker` is on your PATH."
            ))
        } else {
            LaunchError::Process(format!("failed to run `{rendered}`: {err}"))
        }
    })
}

fn handle_config(ctx: &Context, command: ConfigCommand) -> Result<(), LaunchError> {
    match command {
        ConfigCommand::Init => {
            if ctx.config_path.exists() {
                return output(ctx, json!({"path": ctx.config_path, "created": false}));
            }
            ensure_parent(&ctx.config_path)?;
            fs::write(&ctx.config_path, DEFAULT_CONFIG_YAML)?;
            output(ctx, json!({"path": ctx.config_path, "created": true}))
        }
        ConfigCommand::Validate => {
            let _cfg = read_config(&ctx.config_path)?;
            output(ctx, json!({"path": ctx.config_path, "valid": true}))
        }
        ConfigCommand::Show => {
            let cfg = load_config(&ctx.config_path)?;
            if ctx.json {
                let wrapper = JsonResult {
                    ok: true,
                    result: Some(&cfg),
                    error: None,
                };
                return print_json(&wrapper);
            }
            print!("{}", serde_yaml::to_string(&cfg)?);
            Ok(())
        }
    }
}

fn handle_doctor(ctx: &Context) -> Result<(), LaunchError> {
    let mut checks = BTreeMap::new();
    let docker_ok = match which::which("docker") {
        Ok(_) => {
            let status = Command::new("docker")
                .arg("info")
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
            status.map(|s| s.success()).unwrap_or(false)
        }
        Err(_) => false,
    };
    checks.insert("docker".to_string(), docker_ok);

    let config_ok = load_config(&ctx.config_path).is_ok();
    checks.insert("config".to_string(), config_ok);

    let ok = docker_ok && config_ok;
    if ctx.json {
        let payload = JsonResult {
            ok,
            result: Some(json!({ "checks": checks })),
            error: if ok {
                None
            } else {
                Some("environment is not ready".to_string())
            },
        };
        return print_json(&payload);
    }

    println!(
        "Docker: {}",
        if docker_ok { "ok" } else { "missing or not running" }
    );
    println!("Config: {}", if config_ok { "ok" } else { "invalid" });
    if !docker_ok {
        return Err(LaunchError::Process("docker is not available".to_string()));
    }
    if !config_ok {
        return Err(LaunchError::Process(format!(
            "config is invalid: {}",
            ctx.config_path.display()
        )));
    }
    Ok(())
}

fn output(ctx: &Context, payload: serde_json::Value) -> Result<(), LaunchError> {
    if ctx.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
        };
        print_json(&wrapper)?;
    } else {
        println!("{}", payload);
    }
    Ok(())
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), LaunchError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}
