/*
 * Copyright 2021 Oxide Computer Company
 */

use std::process::exit;

use anyhow::{anyhow, bail, Result};
use jmclib::log::prelude::*;

mod ensure;
mod error;
mod events;
mod fetch;
mod filter;
mod fstab;
mod inventory;
mod jail;
mod pkg;
mod provision;
mod source;
mod zfs;

use error::chain;
use filter::Terms;
use inventory::Inventory;
use provision::{Provisioner, Source};

fn main() -> Result<()> {
    let cmd = std::env::args().nth(1)
        .ok_or_else(|| anyhow!("missing command name"))?;

    let mut opts = getopts::Options::new();
    opts.parsing_style(getopts::ParsingStyle::FloatingFrees);

    fn usage(opts: &getopts::Options) {
        let s = opts.usage("jailprov list|provision [OPTIONS] [FILTER...]");
        println!("{}", s);
    }

    let f = match cmd.as_str() {
        "list" => {
            opts.reqopt("d", "dataset", "dataset containing the jails",
                "DATASET");
            opts.optflag("H", "", "do not print a header");

            run_list
        }
        "provision" => {
            opts.reqopt("d", "dataset", "dataset containing the jails",
                "DATASET");
            opts.optopt("s", "source", "control repository path or url \
                (overrides the jail configuration)", "SOURCE");
            opts.optopt("N", "source-name", "name for the control repository",
                "NAME");
            opts.optflag("J", "json", "print events as JSON, one per line");

            run_provision
        }
        n => {
            usage(&opts);
            bail!("invalid command: {}", n);
        }
    };

    let log = jmclib::log::init_log();
    let mat = match opts.parse(std::env::args().skip(2)) {
        Ok(mat) => mat,
        Err(e) => {
            usage(&opts);
            bail!("invalid options: {:?}", e);
        }
    };

    if let Err(e) = f(&log, &mat) {
        crit!(log, "fatal error: {:?}", e);
        exit(1);
    }

    Ok(())
}

fn inventory<'a>(log: &Logger, mat: &getopts::Matches,
    datasets: &'a zfs::Zfs, loader: &'a jail::HostJailLoader)
    -> Result<Inventory<'a>>
{
    let root = mat.opt_str("d")
        .ok_or_else(|| anyhow!("jail dataset (-d) is required"))?;
    if root.contains('@') {
        bail!("jail dataset must not be a snapshot");
    }

    Ok(Inventory {
        log: log.clone(),
        datasets,
        loader,
        root,
    })
}

fn run_list(log: &Logger, mat: &getopts::Matches) -> Result<()> {
    let filters = Terms::parse(&mat.free)?;
    let inv = inventory(log, mat, &zfs::Zfs, &jail::HostJailLoader)?;

    if !mat.opt_present("H") {
        println!("NAME\tJID\tRUNNING\tIP4\tIP6");
    }

    /*
     * Stream the rows out as each jail is loaded.  Jails we cannot load are
     * reported but do not end the listing.
     */
    for res in inv.enumerate(&filters)? {
        let j = match res {
            Ok(j) => j,
            Err(e) => {
                warn!(log, "{}", chain(&e));
                continue;
            }
        };

        println!("{}\t{}\t{}\t{}\t{}",
            j.name(),
            j.jid().map(|jid| jid.to_string())
                .unwrap_or_else(|| "-".to_string()),
            if j.running() { "yes" } else { "no" },
            j.ip4_addr().unwrap_or("-"),
            j.ip6_addr().unwrap_or("-"));
    }

    Ok(())
}

fn run_provision(log: &Logger, mat: &getopts::Matches) -> Result<()> {
    if unsafe { libc::geteuid() } != 0 {
        bail!("provisioning must be run as root");
    }

    let filters = Terms::parse(&mat.free)?;
    if filters.is_empty() {
        bail!("specify which jails to provision");
    }
    let json = mat.opt_present("J");

    let datasets = zfs::Zfs;
    let loader = jail::HostJailLoader;
    let inv = inventory(log, mat, &datasets, &loader)?;

    let jails = inv.enumerate_all(&filters)?;
    if jails.is_empty() {
        bail!("no jails matched {:?}", mat.free);
    }
    info!(log, "provisioning {} jail(s)", jails.len());

    let packages = pkg::Pkg { exec: &pkg::Host };
    let p = Provisioner {
        log: log.clone(),
        datasets: &datasets,
        fetch: &fetch::Git,
        packages: &packages,
    };

    let mut failed = Vec::new();
    for j in jails.iter() {
        let source = if let Some(url) = mat.opt_str("s") {
            Source { name: mat.opt_str("N"), url }
        } else {
            match Source::from_jail(j) {
                Ok(mut s) => {
                    if let Some(n) = mat.opt_str("N") {
                        s.name = Some(n);
                    }
                    s
                }
                Err(e) => {
                    crit!(log, "{}", chain(&e); "jail" => j.name());
                    failed.push(j.name().to_string());
                    continue;
                }
            }
        };

        for res in p.provision(j, &source, None) {
            match res {
                Ok(ev) => {
                    if json {
                        println!("{}", serde_json::to_string(&ev)?);
                    }
                    /*
                     * A fail event is always followed by the error itself,
                     * which is logged below.
                     */
                    if !ev.is_fail() {
                        info!(log, "{}", ev);
                    }
                }
                Err(e) => {
                    crit!(log, "{}", chain(&e); "jail" => j.name());
                    failed.push(j.name().to_string());
                }
            }
        }
    }

    if !failed.is_empty() {
        bail!("provisioning failed for: {}", failed.join(", "));
    }

    Ok(())
}
