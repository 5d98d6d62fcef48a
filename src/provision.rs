/*
 * Copyright 2021 Oxide Computer Company
 */

use std::path::PathBuf;

use jmclib::log::prelude::*;

use crate::ensure;
use crate::error::{chain, ProvisionError};
use crate::events::{Event, EventKind, Phase, Scope};
use crate::fetch::Fetch;
use crate::fstab::{Fstab, MountEntry, MountMode};
use crate::jail::JailRecord;
use crate::pkg::{Packages, PkgEvents};
use crate::source::{ControlRepo, PUPPET_DIR};
use crate::zfs::DatasetStore;

pub const PROVISION_SCRIPT: &str = "provision.sh";

/**
 * Where to provision a jail from.  Without a name, the url is used as the
 * name.
 */
#[derive(Debug, Clone)]
pub struct Source {
    pub name: Option<String>,
    pub url: String,
}

impl Source {
    /**
     * Read the source from the jail configuration.
     */
    pub fn from_jail(jail: &JailRecord) -> Result<Source, ProvisionError> {
        let url = jail.config_value("provisioning.source").unwrap_or("");
        let unavailable = |reason: String| ProvisionError::SourceUnavailable {
            url: url.to_string(),
            reason,
        };

        match jail.config_value("provisioning.method") {
            Some("puppet") => (),
            Some(m) => {
                return Err(unavailable(format!(
                    "unsupported provisioning method {:?}", m)));
            }
            None => {
                return Err(unavailable(format!(
                    "jail {} has no provisioning method", jail.name())));
            }
        }

        Ok(Source {
            name: jail.config_value("provisioning.source.name")
                .map(str::to_string),
            url: url.to_string(),
        })
    }
}

/**
 * The collaborators a provisioning run needs.
 */
pub struct Provisioner<'a> {
    pub log: Logger,
    pub datasets: &'a dyn DatasetStore,
    pub fetch: &'a dyn Fetch,
    pub packages: &'a dyn Packages,
}

impl<'a> Provisioner<'a> {
    /**
     * Provision a jail from a puppet control repository.  Nothing happens
     * until the returned events are consumed; each phase reports begin and
     * then end or fail.  A failure is reported as a Provisioning fail event,
     * followed by the error itself, after which the sequence ends.
     */
    pub fn provision(&self, jail: &JailRecord, source: &Source,
        parent: Option<&Scope>) -> Provision<'_>
    {
        let phase = Phase::new(EventKind::Provisioning, jail.name(), parent);
        let download = Phase::new(EventKind::AssetDownload, jail.name(),
            Some(phase.scope()));

        Provision {
            p: self,
            jail: jail.clone(),
            source: source.clone(),
            phase,
            download,
            state: State::Start,
        }
    }

    /**
     * Get the control repository onto the host, returning the mount source
     * and mode for the jail.
     */
    fn materialise(&self, jail: &JailRecord, repo: &ControlRepo)
        -> Result<(PathBuf, MountMode), ProvisionError>
    {
        let log = &self.log;

        info!(log, "control repository {}: {}", repo.name(), repo.url();
            "jail" => jail.name());

        if let Some(path) = repo.local_path() {
            info!(log, "using local control repository {}", path;
                "jail" => jail.name());
            return Ok((PathBuf::from(path), MountMode::ReadOnly));
        }

        let name = format!("{}/puppet", jail.dataset().name);
        let ds = self.datasets.get_or_create(log, &name)
            .map_err(|e| ProvisionError::Dataset {
                name: name.clone(),
                source: e.into(),
            })?;
        let mp = ds.mountpoint()
            .map_err(|e| ProvisionError::Dataset {
                name: name.clone(),
                source: e.into(),
            })?
            .to_path_buf();

        /*
         * Never clone over an existing checkout.  The dataset mountpoint is an
         * empty directory until the first clone.
         */
        let vacant = ensure::vacant(&mp)
            .map_err(|e| ProvisionError::CloneFailed {
                url: repo.url().to_string(),
                path: mp.clone(),
                source: e.into(),
            })?;
        if vacant {
            self.fetch.clone_into(log, repo.url(), &mp)
                .map_err(|e| ProvisionError::CloneFailed {
                    url: repo.url().to_string(),
                    path: mp.clone(),
                    source: e.into(),
                })?;
        } else {
            info!(log, "{} is populated already; not cloning", mp.display();
                "jail" => jail.name());
        }

        /*
         * r10k deploys into this directory from within the jail.
         */
        Ok((mp, MountMode::ReadWrite))
    }

    fn mount(&self, jail: &JailRecord, source: PathBuf, mode: MountMode)
        -> Result<(), ProvisionError>
    {
        let path = jail.fstab_path().unwrap_or_default();
        let persist = |e: anyhow::Error| ProvisionError::MountPersist {
            path: path.clone(),
            source: e.into(),
        };

        let root = jail.root_path().map_err(persist)?;
        let source_desc = source.display().to_string();
        let mut fstab = Fstab::load(&self.log, &path, &root).map_err(persist)?;
        fstab.upsert(&MountEntry {
            source,
            destination: PathBuf::from(PUPPET_DIR),
            mode,
            auto_create_destination: true,
            replace: true,
        }).map_err(persist)?;
        fstab.save().map_err(persist)?;

        info!(self.log, "mounted {} at {} in {}", source_desc, PUPPET_DIR,
            fstab.path().display(); "jail" => jail.name());
        Ok(())
    }

    fn write_script(&self, jail: &JailRecord, repo: &ControlRepo)
        -> Result<PathBuf, ProvisionError>
    {
        let path = jail.launch_scripts_dir()
            .map(|d| d.join(PROVISION_SCRIPT))
            .unwrap_or_default();
        let failed = |e: anyhow::Error| ProvisionError::Script {
            path: path.clone(),
            source: e.into(),
        };

        let dir = jail.launch_scripts_dir().map_err(failed)?;
        ensure::directory(&self.log, &dir, 0o755).map_err(failed)?;
        ensure::filestr(&self.log, &repo.generate_postinstall(), &path, 0o755)
            .map_err(failed)?;

        Ok(path)
    }

    /**
     * Everything between the asset download and package installation: fetch
     * or locate the repository, mount it, and write the script.
     */
    fn prepare(&self, jail: &JailRecord, repo: &ControlRepo, scope: &Scope)
        -> Result<PkgEvents<'a>, ProvisionError>
    {
        let (source, mode) = self.materialise(jail, repo)?;
        self.mount(jail, source, mode)?;

        let packages = repo.packages();
        let script = self.write_script(jail, repo)?;

        Ok(self.packages.fetch_and_install(&self.log, jail, packages, script,
            scope))
    }
}

enum State<'a> {
    Start,
    Download,
    Describe,
    Prepare(ControlRepo),
    Install(PkgEvents<'a>),
    Raise(ProvisionError),
    Done,
}

/**
 * A provisioning run in progress.  See Provisioner::provision().
 */
pub struct Provision<'p> {
    p: &'p Provisioner<'p>,
    jail: JailRecord,
    source: Source,
    phase: Phase,
    download: Phase,
    state: State<'p>,
}

impl Provision<'_> {
    fn fail(&mut self, e: ProvisionError) -> Event {
        let ev = self.phase.fail(chain(&e));
        self.state = State::Raise(e);
        ev
    }
}

impl Iterator for Provision<'_> {
    type Item = Result<Event, ProvisionError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match std::mem::replace(&mut self.state, State::Done) {
                State::Start => {
                    info!(self.p.log, "provisioning from {}", self.source.url;
                        "jail" => self.jail.name());
                    self.state = State::Download;
                    return Some(Ok(self.phase.begin()));
                }
                State::Download => {
                    self.state = State::Describe;
                    return Some(Ok(self.download.begin()));
                }
                State::Describe => {
                    let name = self.source.name.as_deref()
                        .unwrap_or(&self.source.url);
                    match ControlRepo::new(name, &self.source.url) {
                        Ok(repo) => {
                            self.state = State::Prepare(repo);
                            return Some(Ok(self.download.end()));
                        }
                        Err(e) => {
                            /*
                             * Nothing has been touched yet.  Report the
                             * failure against the download phase and stop.
                             */
                            let ev = self.download.fail(chain(&e));
                            self.state = State::Raise(e);
                            return Some(Ok(ev));
                        }
                    }
                }
                State::Prepare(repo) => {
                    match self.p.prepare(&self.jail, &repo,
                        self.phase.scope())
                    {
                        Ok(events) => self.state = State::Install(events),
                        Err(e) => return Some(Ok(self.fail(e))),
                    }
                }
                State::Install(mut events) => match events.next() {
                    Some(Ok(ev)) => {
                        self.state = State::Install(events);
                        return Some(Ok(ev));
                    }
                    Some(Err(e)) => {
                        return Some(Ok(self.fail(
                            ProvisionError::PackageInstall {
                                source: e.into(),
                            })));
                    }
                    None => {
                        info!(self.p.log, "provisioning complete";
                            "jail" => self.jail.name());
                        return Some(Ok(self.phase.end()));
                    }
                },
                State::Raise(e) => return Some(Err(e)),
                State::Done => return None,
            }
        }
    }
}
