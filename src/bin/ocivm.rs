use anyhow::{bail, Context};
use clap::Parser;
use colored::Colorize;
use ocivm::{
    distribution, layerizer::DiskFormat, layerizer::PushOptions, prune, Cancellation, Config,
    IpswCache, OciStorage, RemoteName, VmDirectory,
};
use std::{collections::BTreeMap, path::PathBuf};

#[derive(Debug, Parser)]
#[clap(version)]
enum Opt {
    /// Pull a VM image from a registry into the local cache
    Pull {
        /// e.g. ghcr.io/org/vm:latest or ghcr.io/org/vm@sha256:...
        name: String,

        /// Number of disk layers downloaded at the same time
        #[clap(long)]
        concurrency: Option<usize>,

        /// Start from a copy of the cached image sharing the most layers
        #[clap(long)]
        deduplicate: bool,

        /// Connect to the registry over plain HTTP
        #[clap(long)]
        insecure: bool,
    },

    /// Push a VM directory to a registry under one or more names
    Push {
        /// Directory with config.json, disk.img and nvram.bin
        #[clap(parse(from_os_str))]
        vm_directory: PathBuf,

        /// Names in the same repository, e.g. ghcr.io/org/vm:v1 ghcr.io/org/vm:latest
        #[clap(required = true)]
        names: Vec<String>,

        /// v1 or v2
        #[clap(long, default_value = "v2")]
        disk_format: DiskFormat,

        /// Number of disk layers uploaded at the same time
        #[clap(long)]
        concurrency: Option<usize>,

        /// Label of the OCI config, as key=value
        #[clap(long = "label", parse(try_from_str = parse_label))]
        labels: Vec<(String, String)>,

        /// Connect to the registry over plain HTTP
        #[clap(long)]
        insecure: bool,
    },

    /// Give a cached image another tag
    Tag { source: String, target: String },

    /// List cached images
    List,

    /// Delete a cached image or tag
    Delete { name: String },

    /// Remove cached images and restore images to free space
    Prune {
        /// Remove entries not used for this many days
        #[clap(long)]
        older_than: Option<i64>,

        /// Remove least recently used entries until the rest fits into this many GB
        #[clap(long)]
        space_budget: Option<u64>,
    },
}

fn parse_label(input: &str) -> anyhow::Result<(String, String)> {
    match input.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => bail!("Label must be key=value: {}", input),
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let config = Config::from_env()?;
    let storage = OciStorage::new(&config)?;
    let cancel = Cancellation::new();
    let on_interrupt = cancel.clone();
    ctrlc::set_handler(move || {
        log::warn!("Interrupted, stopping at the next blob boundary");
        on_interrupt.cancel();
    })
    .context("Failed to install Ctrl-C handler")?;

    match Opt::parse() {
        Opt::Pull {
            name,
            concurrency,
            deduplicate,
            insecure,
        } => {
            let name = RemoteName::parse(&name)?;
            let remote =
                distribution::connect(&name, insecure, config.settings.upload_chunk_size_mb)?;
            let concurrency = concurrency.unwrap_or(config.settings.concurrency);
            storage.pull(&name, &remote, concurrency, deduplicate, &cancel)?;
            println!("{:>12} {}", "Pulled".green().bold(), name);
        }

        Opt::Push {
            vm_directory,
            names,
            disk_format,
            concurrency,
            labels,
            insecure,
        } => {
            let names = names
                .iter()
                .map(|name| RemoteName::parse(name))
                .collect::<Result<Vec<_>, _>>()?;
            let first = &names[0];
            if let Some(other) = names
                .iter()
                .find(|name| name.host != first.host || name.namespace != first.namespace)
            {
                bail!("{} and {} are in different repositories", first, other);
            }

            let vm = VmDirectory::new(vm_directory);
            vm.validate(&vm.name())?;
            let remote =
                distribution::connect(first, insecure, config.settings.upload_chunk_size_mb)?;
            let options = PushOptions {
                layer_size: config.settings.layer_size_bytes,
                concurrency: concurrency.unwrap_or(config.settings.concurrency),
                retries: config.settings.pull_retries,
            };
            let references: Vec<_> = names.iter().map(|name| name.reference.clone()).collect();
            let labels: BTreeMap<String, String> = labels.into_iter().collect();
            let digest =
                vm.push_to_registry(&remote, &references, disk_format, &options, labels, &cancel)?;
            println!("{:>12} {}", "Pushed".green().bold(), first.with_digest(digest));
        }

        Opt::Tag { source, target } => {
            let source = RemoteName::parse(&source)?;
            let target = RemoteName::parse(&target)?;
            storage.tag(&source, &target)?;
            println!("{:>12} {} as {}", "Tagged".green().bold(), source, target);
        }

        Opt::List => {
            for entry in storage.list()? {
                let kind = if entry.is_symlink { "tag" } else { "digest" };
                let size = entry.vm.size()?;
                let allocated = ocivm::prune::Prunable::allocated_size(&entry.vm)?;
                println!(
                    "{:<6} {:>8.1} GB {:>8.1} GB on disk  {}",
                    kind,
                    size as f64 / 1e9,
                    allocated as f64 / 1e9,
                    entry.name.to_string().bold()
                );
            }
        }

        Opt::Delete { name } => {
            let name = RemoteName::parse(&name)?;
            storage.delete(&name)?;
            println!("{:>12} {}", "Deleted".green().bold(), name);
        }

        Opt::Prune {
            older_than,
            space_budget,
        } => {
            if older_than.is_none() && space_budget.is_none() {
                bail!("Specify --older-than or --space-budget");
            }
            let ipsw = IpswCache::new(&config)?;
            let storages: [&dyn prune::PrunableStorage; 2] = [&storage, &ipsw];
            let mut deleted = Vec::new();
            if let Some(days) = older_than {
                let cutoff = chrono::Utc::now() - chrono::Duration::days(days);
                deleted.extend(prune::prune_older_than(&storages, cutoff)?);
            }
            if let Some(gb) = space_budget {
                deleted.extend(prune::prune_space_budget(&storages, gb * 1_000_000_000)?);
            }
            storage.gc().context("Failed to clean up tags of pruned images")?;
            for path in deleted {
                println!("{:>12} {}", "Pruned".green().bold(), path.display());
            }
        }
    }
    Ok(())
}
