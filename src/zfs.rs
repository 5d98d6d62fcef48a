/*
 * Copyright 2021 Oxide Computer Company
 */

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Result};
use jmclib::log::prelude::*;

const ZFS: &str = "/sbin/zfs";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataset {
    pub name: String,
    /**
     * Datasets with a mountpoint of "none" or "legacy" are not mounted in a
     * place we can find, and have no mountpoint here.
     */
    pub mountpoint: Option<PathBuf>,
}

impl Dataset {
    pub fn mountpoint(&self) -> Result<&Path> {
        if let Some(mp) = self.mountpoint.as_deref() {
            Ok(mp)
        } else {
            bail!("dataset {} has no usable mountpoint", self.name);
        }
    }

    /**
     * The last component of the dataset name.
     */
    pub fn basename(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }
}

/**
 * The parts of the dataset hierarchy that jail enumeration and provisioning
 * depend on.
 */
pub trait DatasetStore {
    /**
     * List the immediate children of a dataset, in the order the store reports
     * them.
     */
    fn list_children(&self, parent: &str) -> Result<Vec<Dataset>>;

    /**
     * Return the named dataset, creating it (and any missing parents) first if
     * it does not exist.
     */
    fn get_or_create(&self, log: &Logger, name: &str) -> Result<Dataset>;
}

fn parse_mountpoint(mp: &str) -> Option<PathBuf> {
    match mp {
        "none" | "legacy" | "-" | "" => None,
        mp => Some(PathBuf::from(mp)),
    }
}

/**
 * Parse the output of "zfs list -H -o name,mountpoint", dropping the parent
 * dataset itself.
 */
fn parse_children(parent: &str, out: &str) -> Result<Vec<Dataset>> {
    let mut children = Vec::new();

    for (i, l) in out.lines().enumerate() {
        if l.trim().is_empty() {
            continue;
        }

        let t = l.split('\t').collect::<Vec<_>>();
        let (name, mp) = match t.as_slice() {
            [name, mp] => (*name, *mp),
            _ => bail!("invalid zfs list line {}: {:?}", i, l),
        };

        if name == parent {
            continue;
        }

        children.push(Dataset {
            name: name.to_string(),
            mountpoint: parse_mountpoint(mp),
        });
    }

    Ok(children)
}

/**
 * Run zfs(8) with these arguments, returning its trimmed output.  On failure
 * the error carries whatever zfs wrote to stderr.
 */
fn zfs(args: &[&str]) -> Result<String> {
    let out = Command::new(ZFS)
        .env_clear()
        .args(args)
        .output()?;

    if !out.status.success() {
        let errmsg = String::from_utf8_lossy(&out.stderr);
        bail!("zfs {} failed: {}", args.join(" "), errmsg.trim());
    }

    Ok(String::from_utf8(out.stdout)?.trim().to_string())
}

fn not_snapshot(dataset: &str) -> Result<&str> {
    if dataset.contains('@') {
        bail!("no @ allowed here: {}", dataset);
    }
    Ok(dataset)
}

fn does_not_exist(e: &anyhow::Error) -> bool {
    e.to_string().ends_with("dataset does not exist")
}

/**
 * A dataset store backed by the zfs(8) command.
 */
pub struct Zfs;

impl Zfs {
    fn exists(&self, dataset: &str) -> Result<bool> {
        match zfs(&["list", "-Ho", "name", not_snapshot(dataset)?]) {
            Ok(_) => Ok(true),
            Err(e) if does_not_exist(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

impl DatasetStore for Zfs {
    fn list_children(&self, parent: &str) -> Result<Vec<Dataset>> {
        let out = zfs(&["list", "-H", "-t", "filesystem",
            "-o", "name,mountpoint", "-r", "-d", "1", not_snapshot(parent)?])?;

        parse_children(parent, &out)
    }

    fn get_or_create(&self, log: &Logger, name: &str) -> Result<Dataset> {
        if self.exists(name)? {
            info!(log, "dataset {} exists already", name);
        } else {
            info!(log, "CREATE DATASET: {}", name);
            zfs(&["create", "-p", name])?;
        }

        let mp = zfs(&["get", "-H", "-o", "value", "mountpoint", name])?;
        Ok(Dataset {
            name: name.to_string(),
            mountpoint: parse_mountpoint(&mp),
        })
    }
}
