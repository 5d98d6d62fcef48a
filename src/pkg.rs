/*
 * Copyright 2021 Oxide Computer Company
 */

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use jmclib::log::prelude::*;

use crate::ensure;
use crate::events::{Event, EventKind, Phase, Phases, Scope};
use crate::jail::JailRecord;

const PKG: &str = "/usr/sbin/pkg";
const CHROOT: &str = "/usr/sbin/chroot";
const MOUNT: &str = "/sbin/mount";
const UMOUNT: &str = "/sbin/umount";

pub type PkgEvents<'a> = Box<dyn Iterator<Item = Result<Event>> + 'a>;

/**
 * Installs packages into a jail and runs a script afterwards.  Work happens as
 * the returned events are consumed.
 */
pub trait Packages {
    fn fetch_and_install<'a>(&'a self, log: &Logger, jail: &JailRecord,
        packages: Vec<String>, postinstall: PathBuf, scope: &Scope)
        -> PkgEvents<'a>;
}

/**
 * Runs host commands on behalf of Pkg.
 */
pub trait Exec {
    fn exec(&self, log: &Logger, args: &[&str], stdin: Option<&Path>)
        -> Result<()>;
}

pub struct Host;

impl Exec for Host {
    fn exec(&self, log: &Logger, args: &[&str], stdin: Option<&Path>)
        -> Result<()>
    {
        ensure::run_stdin(log, args, stdin)
    }
}

fn utf8<'p>(p: &'p Path, what: &str) -> Result<&'p str> {
    p.to_str().with_context(|| format!("{} {:?} is not UTF-8", what, p))
}

/**
 * Package installation with pkg(8), run from the host against the jail root.
 */
pub struct Pkg<'e> {
    pub exec: &'e dyn Exec,
}

impl Pkg<'_> {
    fn install(&self, log: &Logger, root: &Path, packages: &[String])
        -> Result<()>
    {
        let root = utf8(root, "jail root")?;

        let mut newargs = vec![PKG, "-r", root, "install", "-y"];
        for pkg in packages {
            newargs.push(pkg);
        }

        info!(log, "PKG INSTALL: {}", packages.join(" "); "root" => root);
        self.exec.exec(log, &newargs, None)
    }

    /**
     * Run the script with /bin/sh chrooted into the jail root.  The jail's
     * mount table is applied first so that the script sees what the jail
     * would see, and is taken down again whether or not the script worked.
     */
    fn postinstall(&self, log: &Logger, root: &Path, fstab: &Path,
        script: &Path) -> Result<()>
    {
        let root = utf8(root, "jail root")?;
        let fstab = if fstab.exists() {
            Some(utf8(fstab, "mount table")?)
        } else {
            info!(log, "no mount table at {}", fstab.display());
            None
        };

        if let Some(fstab) = fstab {
            self.exec.exec(log, &[MOUNT, "-a", "-F", fstab], None)?;
        }

        info!(log, "POSTINSTALL: {}", script.display(); "root" => root);
        let res = self.exec.exec(log, &[CHROOT, root, "/bin/sh", "-s"],
            Some(script));

        if let Some(fstab) = fstab {
            let unmount = self.exec.exec(log, &[UMOUNT, "-a", "-F", fstab],
                None);
            res?;
            return unmount;
        }

        res
    }
}

impl Packages for Pkg<'_> {
    fn fetch_and_install<'a>(&'a self, log: &Logger, jail: &JailRecord,
        packages: Vec<String>, postinstall_script: PathBuf, scope: &Scope)
        -> PkgEvents<'a>
    {
        let (root, fstab) = match (jail.root_path(), jail.fstab_path()) {
            (Ok(root), Ok(fstab)) => (root, fstab),
            (Err(e), _) | (_, Err(e)) => {
                return Box::new(std::iter::once(Err(e)));
            }
        };

        let mut phases = Phases::new();

        if !packages.is_empty() {
            let log = log.clone();
            let root = root.clone();
            phases.push(
                Phase::new(EventKind::PackageInstall, jail.name(), Some(scope)),
                move || self.install(&log, &root, &packages));
        }

        let log = log.clone();
        phases.push(
            Phase::new(EventKind::PackagePostinstall, jail.name(), Some(scope)),
            move || self.postinstall(&log, &root, &fstab, &postinstall_script));

        Box::new(phases)
    }
}
