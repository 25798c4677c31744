// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use std::collections::BTreeMap;
use std::sync::Arc;

use signal_hook::consts::signal::*;
use signal_hook::iterator::Signals;
use slog::error;
use slog::info;
use structopt::StructOpt;

use lldpd::events::LogSink;
use lldpd::logging::LogFormat;
use lldpd::types::AdminStatus;
use lldpd::types::AgentCfg;
use lldpd::types::SystemInfo;
use lldpd::Global;
use lldpd::Services;

#[derive(Debug, StructOpt)]
#[structopt(name = "lldpd", about = "LLDP and DCBX agent")]
enum Args {
    /// Run LLDP on one or more links.
    Run(Opt),
}

#[derive(Clone, Debug, StructOpt)]
struct Opt {
    #[structopt(long, about = "log file")]
    log_file: Option<String>,

    #[structopt(
        long,
        short = "l",
        default_value = "json",
        about = "log format",
        help = "format logs for 'human' or 'json' consumption"
    )]
    log_format: LogFormat,

    #[structopt(long = "link", required = true, help = "link to run lldp on")]
    links: Vec<String>,

    #[structopt(
        long = "chassis",
        short = "c",
        about = "String to use as the ChassisID"
    )]
    chassis_id: Option<String>,

    #[structopt(
        long = "name",
        short = "n",
        about = "String to use as the SystemName"
    )]
    system_name: Option<String>,

    #[structopt(
        long = "desc",
        short = "d",
        about = "String to use as the SystemDescription"
    )]
    system_description: Option<String>,

    #[structopt(
        long,
        default_value = "rxtx",
        help = "admin mode: rxtx, rx, tx, or disabled"
    )]
    mode: AdminStatus,

    #[structopt(long, help = "advertise and negotiate PFC")]
    pfc: bool,

    #[structopt(
        long,
        help = "accept the peer's PFC configuration (true or false)"
    )]
    pfc_willing: Option<bool>,

    #[structopt(long, help = "comma-separated PFC-enabled priorities")]
    pfc_enable: Option<String>,
}

fn get_uname(opt: &str) -> String {
    const UNAME: &str = "/usr/bin/uname";

    if let Ok(out) = std::process::Command::new(UNAME).args(vec![opt]).output()
    {
        if out.status.success() {
            return String::from_utf8_lossy(&out.stdout).trim().to_string();
        }
    }
    "unknown".to_string()
}

fn get_sysinfo(opts: &Opt) -> SystemInfo {
    let chassis_id = match &opts.chassis_id {
        Some(c) => c.to_string(),
        None => get_uname("-n"),
    };
    let system_name = match &opts.system_name {
        Some(s) => s.to_string(),
        None => get_uname("-n"),
    };
    let system_description = match &opts.system_description {
        Some(d) => d.to_string(),
        None => get_uname("-a"),
    };
    SystemInfo {
        chassis_id: protocol::types::ChassisId::ChassisComponent(chassis_id),
        system_name: Some(system_name),
        system_description: Some(system_description),
    }
}

/// Log every agent's neighbor table
fn dump_neighbors(g: &Global, log: &slog::Logger) {
    let table: BTreeMap<String, _> = g
        .agents()
        .into_iter()
        .filter_map(|name| {
            let agent = g.agent_get(&name).ok()?;
            Some((name, agent.neighbors()))
        })
        .collect();
    match serde_json::to_string(&table) {
        Ok(json) => info!(log, "neighbors: {json}"),
        Err(e) => error!(log, "failed to serialize neighbors: {e}"),
    }
}

fn signal_handler(g: &Global) -> anyhow::Result<()> {
    const SIGNALS: &[std::ffi::c_int] = &[SIGTERM, SIGQUIT, SIGINT, SIGUSR1];
    let mut sigs = Signals::new(SIGNALS)?;

    let log = g.log.new(slog::o!("unit" => "signal-handler"));
    for signal in &mut sigs {
        if signal == SIGINT || signal == SIGQUIT || signal == SIGTERM {
            info!(&log, "caught signal {signal} - exiting");
            break;
        }
        if signal == SIGUSR1 {
            dump_neighbors(g, &log);
        }
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn enable_link(g: &Global, opts: &Opt, link: &str) -> anyhow::Result<()> {
    use anyhow::Context;
    use lldpd::dcbx::Feature;
    use lldpd::plat_linux;
    use lldpd::tlv::MaskOp;
    use lldpd::tlv::OptionalTlv;
    use lldpd::tlv::TlvCategory;

    let mac = plat_linux::get_mac(link)
        .with_context(|| format!("getting mac address of {link}"))?;
    let transport = plat_linux::PnetTransport::open(link)?;
    let cfg = AgentCfg {
        admin_status: opts.mode,
        ..Default::default()
    };
    let agent = g.agent_enable(link, Arc::new(transport), mac, cfg)?;

    if opts.pfc {
        agent.set_tlv_mask(TlvCategory::Dcbx, &[OptionalTlv::Pfc], MaskOp::Add)?;
        if let Some(willing) = opts.pfc_willing {
            agent.set_feature_property(
                Feature::Pfc,
                "willing",
                &willing.to_string(),
            )?;
        }
        if let Some(enable) = &opts.pfc_enable {
            agent.set_feature_property(Feature::Pfc, "enable", enable)?;
        }
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn run_lldpd(opts: Opt) -> anyhow::Result<()> {
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::Ordering;

    let log = lldpd::logging::init(
        "lldpd",
        opts.log_file.as_deref(),
        opts.log_format,
    )?;

    let sysinfo = get_sysinfo(&opts);
    info!(&log, "starting"; "chassis" => ?sysinfo.chassis_id);

    let services = Services::new(&log, Arc::new(LogSink::new(&log)))?;
    let global = Arc::new(Global::new(&log, sysinfo, services));

    for link in &opts.links {
        if let Err(e) = enable_link(&global, &opts, link) {
            error!(&log, "failed to enable lldp on {link}: {e:#}");
        }
    }
    if global.agents().is_empty() {
        global.shutdown_all();
        anyhow::bail!("no links could be enabled");
    }

    let stop = Arc::new(AtomicBool::new(false));
    let monitor = lldpd::plat_linux::link_monitor(global.clone(), stop.clone())?;

    let rval = signal_handler(&global);

    stop.store(true, Ordering::Release);
    if monitor.join().is_err() {
        error!(&log, "link monitor panicked");
    }
    global.shutdown_all();

    info!(&log, "exiting");
    rval
}

#[cfg(not(target_os = "linux"))]
fn run_lldpd(_opts: Opt) -> anyhow::Result<()> {
    anyhow::bail!("raw link access is only supported on linux")
}

fn main() -> anyhow::Result<()> {
    let args = Args::from_args();

    match args {
        Args::Run(opt) => run_lldpd(opt),
    }
}
