/*
 * Copyright 2021 Oxide Computer Company
 */

use std::fmt;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use jmclib::log::prelude::*;

use crate::ensure;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountMode {
    ReadWrite,
    ReadOnly,
}

impl MountMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MountMode::ReadWrite => "rw",
            MountMode::ReadOnly => "ro",
        }
    }
}

/**
 * A mount to be added to a jail.  The destination is relative to the jail
 * root.
 */
#[derive(Debug, Clone)]
pub struct MountEntry {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub mode: MountMode,
    pub auto_create_destination: bool,
    pub replace: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FstabLine {
    pub source: String,
    pub destination: String,
    pub fstype: String,
    pub options: String,
    pub freq: u32,
    pub passno: u32,
    pub comment: Option<String>,
}

fn escape(s: &str) -> String {
    s.replace(' ', "\\ ")
}

impl fmt::Display for FstabLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\t{}\t{}\t{}\t{}\t{}",
            escape(&self.source),
            escape(&self.destination),
            self.fstype,
            self.options,
            self.freq,
            self.passno)?;
        if let Some(c) = &self.comment {
            write!(f, " # {}", c)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    /*
     * Comments and blank lines are kept so that they can be written back out
     * as they were.
     */
    Verbatim(String),
    Mount(FstabLine),
}

/**
 * Split on whitespace that is not escaped with a backslash.
 */
fn fields(s: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\\' && chars.peek().map_or(false, |n| n.is_whitespace()) {
            if let Some(n) = chars.next() {
                cur.push(n);
            }
        } else if c.is_whitespace() {
            if !cur.is_empty() {
                out.push(std::mem::take(&mut cur));
            }
        } else {
            cur.push(c);
        }
    }
    if !cur.is_empty() {
        out.push(cur);
    }

    out
}

/**
 * The fstab(5) file for one jail.
 */
#[derive(Debug)]
pub struct Fstab {
    log: Logger,
    path: PathBuf,
    root: PathBuf,
    lines: Vec<Line>,
}

impl Fstab {
    /**
     * Load the mount table at "path" for a jail whose root file system is at
     * "root".  A missing file is an empty table.
     */
    pub fn load<P, R>(log: &Logger, path: P, root: R) -> Result<Fstab>
        where P: AsRef<Path>, R: AsRef<Path>
    {
        let path = path.as_ref().to_path_buf();

        let data = match fs::read_to_string(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
            Err(e) => bail!("reading {}: {}", path.display(), e),
        };

        let mut fstab = Fstab {
            log: log.clone(),
            path,
            root: root.as_ref().to_path_buf(),
            lines: Vec::new(),
        };
        fstab.parse(&data);

        Ok(fstab)
    }

    fn parse(&mut self, data: &str) {
        for (i, l) in data.lines().enumerate() {
            let t = l.trim();
            if t.is_empty() || t.starts_with('#') {
                self.lines.push(Line::Verbatim(l.to_string()));
                continue;
            }

            let (body, comment) = match l.split_once('#') {
                Some((body, c)) => {
                    let c = c.trim_matches(|c: char| c == '#' || c == ' ');
                    (body, if c.is_empty() { None } else { Some(c) })
                }
                None => (l, None),
            };

            let f = fields(body);
            if f.len() != 6 {
                warn!(self.log, "invalid line {} in {}; skipping", i + 1,
                    self.path.display());
                continue;
            }

            let (freq, passno) = match (f[4].parse(), f[5].parse()) {
                (Ok(freq), Ok(passno)) => (freq, passno),
                _ => {
                    warn!(self.log, "invalid dump/pass on line {} in {}; \
                        skipping", i + 1, self.path.display());
                    continue;
                }
            };

            self.lines.push(Line::Mount(FstabLine {
                source: f[0].to_string(),
                destination: f[1].to_string(),
                fstype: f[2].to_string(),
                options: f[3].to_string(),
                freq,
                passno,
                comment: comment.map(str::to_string),
            }));
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mounts(&self) -> impl Iterator<Item = &FstabLine> {
        self.lines.iter().filter_map(|l| match l {
            Line::Mount(m) => Some(m),
            Line::Verbatim(_) => None,
        })
    }

    /**
     * Turn a destination inside the jail into a path on the host.
     */
    fn host_destination(&self, dst: &Path) -> Result<PathBuf> {
        if dst.starts_with(&self.root) {
            return Ok(dst.to_path_buf());
        }

        let rel = dst.strip_prefix("/").unwrap_or(dst);
        if rel.components().any(|c| !matches!(c,
            std::path::Component::Normal(_)))
        {
            bail!("mount destination {} escapes the jail", dst.display());
        }

        Ok(self.root.join(rel))
    }

    /**
     * Add a mount.  An existing mount at the same destination is removed
     * first if "replace" is set, and is an error otherwise.  Call save() to
     * write the change out.
     */
    pub fn upsert(&mut self, entry: &MountEntry) -> Result<()> {
        let dst = self.host_destination(&entry.destination)?;
        let dsts = dst.to_str()
            .with_context(|| format!("destination {:?} is not UTF-8", dst))?
            .to_string();
        let src = entry.source.to_str()
            .with_context(|| format!("source {:?} is not UTF-8",
                entry.source))?
            .to_string();

        let exists = self.mounts().any(|m| m.destination == dsts);
        if exists {
            if !entry.replace {
                bail!("mount destination {} exists already", dsts);
            }
            info!(self.log, "replacing fstab line with destination {}", dsts);
            self.lines.retain(|l| match l {
                Line::Mount(m) => m.destination != dsts,
                Line::Verbatim(_) => true,
            });
        }

        if entry.auto_create_destination {
            if fs::symlink_metadata(&dst)
                .map(|md| md.file_type().is_symlink())
                .unwrap_or(false)
            {
                bail!("mount destination {} is a symlink", dst.display());
            }
            ensure::directory(&self.log, &dst, 0o700)?;
        }

        let line = FstabLine {
            source: src,
            destination: dsts,
            fstype: "nullfs".to_string(),
            options: entry.mode.as_str().to_string(),
            freq: 0,
            passno: 0,
            comment: None,
        };
        info!(self.log, "adding fstab line: {}", line);
        self.lines.push(Line::Mount(line));

        Ok(())
    }

    /**
     * Write the table out.  The new contents go to a temporary file that is
     * then renamed over the original, so readers see either the old table or
     * the new one.
     */
    pub fn save(&self) -> Result<()> {
        let mut data = self.to_string();
        if !data.is_empty() {
            data.push('\n');
        }

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let mut f = fs::File::create(&tmp)
            .with_context(|| format!("creating {}", tmp.display()))?;
        f.write_all(data.as_bytes())?;
        f.sync_all()?;
        drop(f);

        fs::rename(&tmp, &self.path).with_context(|| {
            format!("renaming {} to {}", tmp.display(), self.path.display())
        })?;

        info!(self.log, "{} written", self.path.display());
        Ok(())
    }
}

impl fmt::Display for Fstab {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, l) in self.lines.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            match l {
                Line::Verbatim(s) => write!(f, "{}", s)?,
                Line::Mount(m) => write!(f, "{}", m)?,
            }
        }
        Ok(())
    }
}
