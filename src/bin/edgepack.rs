use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use edgepack::bootstrap::{self, AddNodeOptions, Role};
use edgepack::config::Config;
use edgepack::node::{default_sink, SshAuth};
use edgepack::package::{verify_digest, Package};
use tracing_subscriber::EnvFilter;

fn usage() -> &'static str {
    "Usage:\n  edgepack [--config FILE] package create <source_dir> <output>\n  edgepack [--config FILE] package inspect <archive>\n  edgepack [--config FILE] package verify <archive> [sha256]\n  edgepack [--config FILE] node add <archive> <address> [--user U] [--port P] [--key FILE | --password-env VAR] [--role server|agent] [--sha256 HEX]"
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let config = take_config(&mut args)?;

    match args.as_slice() {
        [package, create, source_dir, output] if package == "package" && create == "create" => {
            create_package(&config, Path::new(source_dir), Path::new(output))
        }
        [package, inspect, archive] if package == "package" && inspect == "inspect" => {
            inspect_package(&config, Path::new(archive))
        }
        [package, verify, archive] if package == "package" && verify == "verify" => {
            verify_package(&config, Path::new(archive), None)
        }
        [package, verify, archive, sha] if package == "package" && verify == "verify" => {
            verify_package(&config, Path::new(archive), Some(sha))
        }
        [node, add, archive, address, flags @ ..] if node == "node" && add == "add" => {
            add_node(&config, Path::new(archive), address, flags)
        }
        _ => bail!(usage()),
    }
}

/// Strip `--config FILE` from `args` and load it, or the default config.
fn take_config(args: &mut Vec<String>) -> Result<Config> {
    let Some(pos) = args.iter().position(|a| a == "--config") else {
        return Config::load_default().context("loading default config");
    };
    if pos + 1 >= args.len() {
        bail!("--config needs a file\n{}", usage());
    }
    let path = PathBuf::from(args.remove(pos + 1));
    args.remove(pos);
    Config::load(&path).with_context(|| format!("loading config '{}'", path.display()))
}

fn create_package(config: &Config, source_dir: &Path, output: &Path) -> Result<()> {
    let mut package = Package::from_directory(source_dir, &config.package)
        .with_context(|| format!("packaging '{}'", source_dir.display()))?;
    let archive = package.archive().context("sealing package")?;
    let sha = archive.sha256().context("hashing archive")?;
    let size = archive
        .persist(output)
        .with_context(|| format!("writing '{}'", output.display()))?;
    let count = package.manifest().len();
    package.close().context("cleaning up package workdir")?;

    println!("{}  {}", sha, output.display());
    println!("{count} artifacts, {size} bytes");
    Ok(())
}

fn inspect_package(config: &Config, archive: &Path) -> Result<()> {
    let package = Package::load(archive, config.package.store)
        .with_context(|| format!("loading '{}'", archive.display()))?;
    let meta = serde_json::to_string_pretty(package.meta()).context("rendering metadata")?;
    package.close().context("cleaning up package workdir")?;
    println!("{meta}");
    Ok(())
}

fn verify_package(config: &Config, archive: &Path, sha: Option<&String>) -> Result<()> {
    if let Some(sha) = sha {
        verify_digest(archive, sha)
            .with_context(|| format!("checking digest of '{}'", archive.display()))?;
    }
    // Loading checks every artifact digest against the manifest.
    let package = Package::load(archive, config.package.store)
        .with_context(|| format!("verifying '{}'", archive.display()))?;
    package
        .verify()
        .with_context(|| format!("re-hashing stored artifacts of '{}'", archive.display()))?;
    let count = package.manifest().len();
    package.close().context("cleaning up package workdir")?;
    println!("{}: ok ({count} artifacts)", archive.display());
    Ok(())
}

fn add_node(config: &Config, archive: &Path, address: &str, flags: &[String]) -> Result<()> {
    let mut ssh = config.ssh.options(address);
    let mut opts = AddNodeOptions::new(archive);
    opts.layout = config.install.clone();
    opts.control_plane = config.control_plane.clone();
    opts.store = config.package.store;

    let mut key: Option<PathBuf> = None;
    let mut password_env: Option<String> = None;
    let mut it = flags.iter();
    while let Some(flag) = it.next() {
        let mut value = || {
            it.next()
                .with_context(|| format!("{flag} needs a value\n{}", usage()))
        };
        match flag.as_str() {
            "--user" => ssh.user = value()?.clone(),
            "--port" => {
                let raw = value()?;
                ssh.port = raw
                    .parse()
                    .with_context(|| format!("invalid port '{raw}'"))?;
            }
            "--key" => key = Some(PathBuf::from(value()?)),
            "--password-env" => password_env = Some(value()?.clone()),
            "--role" => opts.role = value()?.parse::<Role>()?,
            "--sha256" => opts.sha256 = Some(value()?.clone()),
            other => bail!("unknown flag '{other}'\n{}", usage()),
        }
    }

    match (key, password_env) {
        (Some(_), Some(_)) => bail!("--key and --password-env are mutually exclusive"),
        (Some(key), None) => ssh.auth = SshAuth::KeyFile(key),
        (None, Some(var)) => {
            let password = std::env::var(&var)
                .with_context(|| format!("reading SSH password from ${var}"))?;
            ssh.auth = SshAuth::Password(password);
        }
        (None, None) => {}
    }

    bootstrap::add_node(&opts, &ssh, default_sink())
        .with_context(|| format!("adding node {address} as {}", opts.role))
}
