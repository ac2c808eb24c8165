//! ---
//! warden_section: "01-core-functionality"
//! warden_subsection: "binary"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Binary entrypoint for the Warden daemon."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
//! Operator commands run against the shared database.

use std::io::Write;

use anyhow::{anyhow, Result};
use chrono::Utc;
use clap::Subcommand;
use warden_persistence::{disable_host, enable_host, NewFencer, Store};

#[derive(Debug, Subcommand)]
pub enum HostCommand {
    #[command(about = "List known hosts with their status and failure counters")]
    List,
    #[command(about = "Stop counting failures for a host and never fence it")]
    Disable { name: String },
    #[command(about = "Re-enable a host, resetting it to initial with cleared counters")]
    Enable { name: String },
}

#[derive(Debug, Subcommand)]
pub enum FencerCommand {
    #[command(about = "Register an IPMI fencer for a host")]
    Add {
        host: String,
        #[arg(long)]
        address: String,
        #[arg(long, default_value_t = 623)]
        port: u16,
        #[arg(long)]
        username: String,
        #[arg(long, env = "WARDEN_FENCER_PASSWORD", hide_env_values = true)]
        password: String,
    },
    #[command(about = "List the fencers of a host in the order they are tried")]
    List { host: String },
    #[command(about = "Remove a fencer by id")]
    Remove { id: u64 },
}

pub async fn host_command(store: &dyn Store, command: HostCommand, out: &mut impl Write) -> Result<()> {
    match command {
        HostCommand::List => {
            for host in store.hosts().await? {
                let counters: Vec<String> = store
                    .host_states(host.id)
                    .await?
                    .into_iter()
                    .map(|state| format!("{}={}", state.tag, state.failed_times))
                    .collect();
                writeln!(
                    out,
                    "{}\t{}\t{}\t{}\t{}",
                    host.id,
                    host.name,
                    host.status,
                    if host.disabled { "disabled" } else { "enabled" },
                    counters.join(",")
                )?;
            }
        }
        HostCommand::Disable { name } => {
            let host = disable_host(store, &name).await?;
            writeln!(out, "host {} disabled", host.name)?;
        }
        HostCommand::Enable { name } => {
            let host = enable_host(store, &name, Utc::now()).await?;
            writeln!(out, "host {} enabled ({})", host.name, host.status)?;
        }
    }
    Ok(())
}

pub async fn fencer_command(store: &dyn Store, command: FencerCommand, out: &mut impl Write) -> Result<()> {
    match command {
        FencerCommand::Add {
            host,
            address,
            port,
            username,
            password,
        } => {
            let host = store
                .host_by_name(&host)
                .await?
                .ok_or_else(|| anyhow!("host {host} not found"))?;
            let mut fencer = NewFencer::ipmi(host.id, address, username, password);
            fencer.port = port;
            let fencer = store.insert_fencer(fencer).await?;
            writeln!(out, "fencer {} added to {}", fencer.id, host.name)?;
        }
        FencerCommand::List { host } => {
            let host = store
                .host_by_name(&host)
                .await?
                .ok_or_else(|| anyhow!("host {host} not found"))?;
            for fencer in store.fencers_for_host(host.id).await? {
                writeln!(
                    out,
                    "{}\t{}\t{}:{}\t{}",
                    fencer.id, fencer.kind, fencer.address, fencer.port, fencer.username
                )?;
            }
        }
        FencerCommand::Remove { id } => {
            store.delete_fencer(id).await?;
            writeln!(out, "fencer {id} removed")?;
        }
    }
    Ok(())
}

pub async fn show_leader(store: &dyn Store, election: &str, out: &mut impl Write) -> Result<()> {
    match store.lease(election).await? {
        Some(lease) => writeln!(
            out,
            "{}\t{}\t{}",
            lease.election_name,
            lease.leader_name,
            lease.last_update.to_rfc3339()
        )?,
        None => writeln!(out, "{election}\tno leader")?,
    }
    Ok(())
}
