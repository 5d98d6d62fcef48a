/*
 * Copyright 2021 Oxide Computer Company
 */

use std::path::Path;

use anyhow::{bail, Result};
use jmclib::log::prelude::*;

use crate::ensure;

const GIT: &str = "/usr/local/bin/git";

/**
 * Fetches a remote repository into a local directory.
 */
pub trait Fetch {
    fn clone_into(&self, log: &Logger, url: &str, dst: &Path) -> Result<()>;
}

pub struct Git;

impl Fetch for Git {
    fn clone_into(&self, log: &Logger, url: &str, dst: &Path) -> Result<()> {
        let dsts = match dst.to_str() {
            Some(s) => s,
            None => bail!("clone destination {:?} is not UTF-8", dst),
        };

        info!(log, "CLONE: {} -> {}", url, dsts);
        ensure::run(log, &[GIT, "clone", "--quiet", "--", url, dsts])
    }
}
