/*
 * Copyright 2021 Oxide Computer Company
 */

use crate::error::ProvisionError;

/*
 * Where the control repository is mounted inside the jail, and the files the
 * generated script refers to below it.
 */
pub const PUPPET_DIR: &str = "/usr/local/etc/puppet";
const ENVIRONMENTS_DIR: &str = "/usr/local/etc/puppet/environments";
const SITE_MANIFEST: &str =
    "/usr/local/etc/puppet/environments/manifests/site.pp";
const R10K_DIR: &str = "/usr/local/etc/r10k";

pub const PUPPET_PACKAGE: &str = "puppet6";
pub const R10K_PACKAGE: &str = "rubygem-r10k";

/**
 * A puppet control repository to provision a jail from.  A url that starts
 * with "file://" or "/" is local and is mounted into the jail as it is;
 * anything else is treated as remote and gets cloned first.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRepo {
    name: String,
    url: String,
    local: bool,
}

impl ControlRepo {
    pub fn new(name: &str, url: &str) -> Result<ControlRepo, ProvisionError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(ProvisionError::SourceUnavailable {
                url: url.to_string(),
                reason: "no source url configured".to_string(),
            });
        }

        let name = name.trim();
        if name.is_empty() {
            return Err(ProvisionError::SourceUnavailable {
                url: url.to_string(),
                reason: "the source needs a name".to_string(),
            });
        }

        Ok(ControlRepo {
            name: name.to_string(),
            url: url.to_string(),
            local: url.starts_with("file://") || url.starts_with('/'),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn local(&self) -> bool {
        self.local
    }

    pub fn remote(&self) -> bool {
        !self.local()
    }

    /**
     * The host path to mount for a local source.  A "file://" prefix is
     * dropped; remote sources have no such path.
     */
    pub fn local_path(&self) -> Option<&str> {
        if self.remote() {
            None
        } else if let Some(p) = self.url.strip_prefix("file://") {
            Some(p)
        } else {
            Some(&self.url)
        }
    }

    /**
     * Packages that must be installed in the jail to apply this source.
     */
    pub fn packages(&self) -> Vec<String> {
        let mut pkgs = vec![PUPPET_PACKAGE.to_string()];
        if self.remote() {
            pkgs.push(R10K_PACKAGE.to_string());
        }
        pkgs
    }

    /**
     * Produce the script that is run inside the jail once packages are
     * installed.  Remote sources are deployed with r10k before puppet runs.
     */
    pub fn generate_postinstall(&self) -> String {
        let mut s = String::new();
        s += "#!/bin/sh\n";
        s += "set -eu\n";
        s += "\n";

        if self.remote() {
            s += &format!("mkdir -p {}\n", R10K_DIR);
            s += &format!("cat > {}/r10k.yaml <<'EOF'\n", R10K_DIR);
            s += "---\n";
            s += ":sources:\n";
            s += "  puppet:\n";
            s += &format!("    basedir: {}\n", ENVIRONMENTS_DIR);
            s += &format!("    remote: '{}'\n", self.url.replace('\'', "''"));
            s += "EOF\n";
            s += "\n";
            s += "r10k deploy environment -p\n";
            s += "\n";
        }

        s += &format!("puppet apply {}\n", SITE_MANIFEST);
        s
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn classify() {
        for url in ["/srv/puppet-env", "file:///srv/puppet-env", "/"].iter() {
            let c = ControlRepo::new("env", url).unwrap();
            assert!(c.local(), "{}", url);
            assert!(!c.remote(), "{}", url);
        }

        for url in [
            "https://git.example/env.git",
            "git@git.example:env.git",
            "relative/path",
            "file:/not-quite",
            "not a url at all",
        ].iter() {
            let c = ControlRepo::new("env", url).unwrap();
            assert!(c.remote(), "{}", url);
            assert!(!c.local(), "{}", url);
        }
    }

    #[test]
    fn empty_source_unavailable() {
        match ControlRepo::new("env", "  ") {
            Err(ProvisionError::SourceUnavailable { .. }) => (),
            other => panic!("unexpected {:?}", other),
        }
        assert!(ControlRepo::new("", "/srv/env").is_err());
    }

    #[test]
    fn local_path() {
        let c = ControlRepo::new("env", "file:///srv/env").unwrap();
        assert_eq!(c.local_path(), Some("/srv/env"));
        let c = ControlRepo::new("env", "/srv/env").unwrap();
        assert_eq!(c.local_path(), Some("/srv/env"));
        let c = ControlRepo::new("env", "https://git.example/env.git").unwrap();
        assert_eq!(c.local_path(), None);
    }

    #[test]
    fn packages() {
        let c = ControlRepo::new("env", "/srv/env").unwrap();
        assert_eq!(c.packages(), vec![PUPPET_PACKAGE]);

        let c = ControlRepo::new("env", "https://git.example/env.git").unwrap();
        assert_eq!(c.packages(), vec![PUPPET_PACKAGE, R10K_PACKAGE]);
    }

    #[test]
    fn postinstall_local() {
        let c = ControlRepo::new("env", "/srv/puppet-env").unwrap();
        assert_eq!(c.generate_postinstall(), "#!/bin/sh\n\
            set -eu\n\
            \n\
            puppet apply /usr/local/etc/puppet/environments/manifests/site.pp\n");
    }

    #[test]
    fn postinstall_remote() {
        let c = ControlRepo::new("env", "https://git.example/env.git").unwrap();
        let s = c.generate_postinstall();

        assert!(s.starts_with("#!/bin/sh\nset -eu\n"));
        assert!(s.contains("remote: 'https://git.example/env.git'\n"));
        assert!(s.contains("r10k deploy environment -p\n"));

        let deploy = s.find("r10k deploy").unwrap();
        let apply = s.find("puppet apply").unwrap();
        assert!(deploy < apply);
        assert!(s.ends_with(
            "puppet apply /usr/local/etc/puppet/environments/manifests/site.pp\n"));
    }
}
