/*
 * Copyright 2021 Oxide Computer Company
 */

use std::fs;
use std::io::{ErrorKind, Write};
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::Path;
use std::process::{Command, Stdio};

use anyhow::{bail, Context, Result};
use jmclib::log::prelude::*;

/**
 * Run a program with a cleared environment, failing if it does not exit
 * successfully.  The first element of "args" is the program to execute.
 */
pub fn run(log: &Logger, args: &[&str]) -> Result<()> {
    run_stdin(log, args, None)
}

/**
 * Run a program as per run(), feeding the contents of "stdin" (if provided) to
 * its standard input.
 */
pub fn run_stdin(log: &Logger, args: &[&str], stdin: Option<&Path>)
    -> Result<()>
{
    if args.is_empty() {
        bail!("no program specified");
    }

    info!(log, "EXEC: {:?}", args);

    let mut cmd = Command::new(args[0]);
    cmd.env_clear();
    cmd.env("PATH", "/bin:/usr/bin:/sbin:/usr/sbin:/usr/local/bin");
    cmd.args(&args[1..]);
    if let Some(stdin) = stdin {
        let f = fs::File::open(stdin)
            .with_context(|| format!("opening {}", stdin.display()))?;
        cmd.stdin(Stdio::from(f));
    } else {
        cmd.stdin(Stdio::null());
    }

    let out = cmd.output()
        .with_context(|| format!("executing {}", args[0]))?;

    if !out.status.success() {
        let errmsg = String::from_utf8_lossy(&out.stderr);
        bail!("exec {:?} failed: {}: {}", args, out.status, errmsg.trim());
    }

    Ok(())
}

/**
 * Make sure a directory exists at this path with the given mode.  Missing
 * parent directories are created as well.  An existing directory keeps its
 * current permissions.
 */
pub fn directory<P: AsRef<Path>>(log: &Logger, dir: P, mode: u32)
    -> Result<()>
{
    let dir = dir.as_ref();

    match fs::symlink_metadata(dir) {
        Ok(md) => {
            if md.file_type().is_symlink() {
                bail!("{} is a symlink; refusing to use it", dir.display());
            }
            if !md.is_dir() {
                bail!("{} exists but is not a directory", dir.display());
            }
            return Ok(());
        }
        Err(e) if e.kind() == ErrorKind::NotFound => (),
        Err(e) => bail!("stat {}: {}", dir.display(), e),
    }

    info!(log, "CREATE DIRECTORY ({:o}): {}", mode, dir.display());
    fs::DirBuilder::new()
        .recursive(true)
        .mode(mode)
        .create(dir)
        .with_context(|| format!("creating directory {}", dir.display()))?;

    Ok(())
}

/**
 * Write a string to a file, replacing whatever was there before, and set the
 * file mode.
 */
pub fn filestr<P: AsRef<Path>>(log: &Logger, contents: &str, dst: P,
    mode: u32) -> Result<()>
{
    let dst = dst.as_ref();

    info!(log, "WRITE FILE ({:o}): {}", mode, dst.display());

    let mut f = fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(dst)
        .with_context(|| format!("opening {} for write", dst.display()))?;
    f.write_all(contents.as_bytes())?;
    f.flush()?;

    fs::set_permissions(dst, fs::Permissions::from_mode(mode))
        .with_context(|| format!("chmod {}", dst.display()))?;

    Ok(())
}

/**
 * Returns true if nothing exists at this path, or if it is a directory with no
 * entries.  Anything else (a populated directory, a file) is occupied.
 */
pub fn vacant<P: AsRef<Path>>(p: P) -> Result<bool> {
    let p = p.as_ref();

    let mut diri = match fs::read_dir(p) {
        Ok(diri) => diri,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
        Err(e) => bail!("read_dir {}: {}", p.display(), e),
    };

    Ok(diri.next().transpose()?.is_none())
}
