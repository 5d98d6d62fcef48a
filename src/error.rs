/*
 * Copyright 2021 Oxide Computer Company
 */

use std::path::PathBuf;

use thiserror::Error;

type Source = Box<dyn std::error::Error + Send + Sync + 'static>;

/**
 * Failures of a provisioning run.  Nothing done before the failure is rolled
 * back.
 */
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("control source {url:?} is not available: {reason}")]
    SourceUnavailable { url: String, reason: String },

    #[error("could not get dataset {name}: {source}")]
    Dataset { name: String, source: Source },

    #[error("could not clone {url:?} into {}: {source}", .path.display())]
    CloneFailed { url: String, path: PathBuf, source: Source },

    #[error("could not update mount table {}: {source}", .path.display())]
    MountPersist { path: PathBuf, source: Source },

    #[error("could not write post-install script {}: {source}",
        .path.display())]
    Script { path: PathBuf, source: Source },

    #[error("package installation failed: {source}")]
    PackageInstall { source: Source },
}

/**
 * A jail found in the dataset tree that could not be loaded.
 */
#[derive(Debug, Error)]
#[error("could not load jail {name:?} from dataset {dataset}: {source}")]
pub struct CandidateError {
    pub name: String,
    pub dataset: String,
    pub source: Source,
}

/**
 * Render an error along with everything in its source chain.
 */
pub fn chain(e: &(dyn std::error::Error + 'static)) -> String {
    let mut out = e.to_string();
    let mut cur = e.source();
    while let Some(s) = cur {
        let m = s.to_string();
        if !out.contains(&m) {
            out += ": ";
            out += &m;
        }
        cur = s.source();
    }
    out
}
