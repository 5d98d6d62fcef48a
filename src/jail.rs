/*
 * Copyright 2021 Oxide Computer Company
 */

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;

use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;

use crate::zfs::Dataset;

const JLS: &str = "/usr/sbin/jls";

/**
 * What we know about a jail before loading anything: just the name, taken from
 * the last component of its dataset name.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JailCandidate {
    pub name: String,
}

impl JailCandidate {
    pub fn from_dataset(ds: &Dataset) -> JailCandidate {
        JailCandidate {
            name: ds.basename().to_string(),
        }
    }

    /**
     * The name the kernel knows this jail by once it is running.
     */
    pub fn identifier(&self) -> String {
        format!("ioc-{}", self.name)
    }
}

/**
 * Kernel state for a running jail, as reported by jls(8).
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeState {
    pub jid: u32,
    pub ip4_addr: Option<String>,
    pub ip6_addr: Option<String>,
}

#[derive(Debug, Clone)]
pub struct JailRecord {
    name: String,
    dataset: Dataset,
    config: BTreeMap<String, String>,
    state: Option<RuntimeState>,
}

impl JailRecord {
    pub fn new(name: &str, dataset: Dataset, config: BTreeMap<String, String>,
        state: Option<RuntimeState>) -> JailRecord
    {
        JailRecord {
            name: name.to_string(),
            dataset,
            config,
            state,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    pub fn jid(&self) -> Option<u32> {
        self.state.as_ref().map(|s| s.jid)
    }

    pub fn running(&self) -> bool {
        self.state.is_some()
    }

    /**
     * Addresses come from the kernel while the jail runs, and from the jail
     * configuration otherwise.
     */
    pub fn ip4_addr(&self) -> Option<&str> {
        self.state.as_ref()
            .and_then(|s| s.ip4_addr.as_deref())
            .or_else(|| self.config_value("ip4.addr"))
    }

    pub fn ip6_addr(&self) -> Option<&str> {
        self.state.as_ref()
            .and_then(|s| s.ip6_addr.as_deref())
            .or_else(|| self.config_value("ip6.addr"))
    }

    pub fn config_value(&self, key: &str) -> Option<&str> {
        self.config.get(key).map(String::as_str)
    }

    pub fn root_path(&self) -> Result<PathBuf> {
        Ok(self.dataset.mountpoint()?.join("root"))
    }

    pub fn fstab_path(&self) -> Result<PathBuf> {
        Ok(self.dataset.mountpoint()?.join("fstab"))
    }

    pub fn launch_scripts_dir(&self) -> Result<PathBuf> {
        Ok(self.dataset.mountpoint()?.join("launch-scripts"))
    }
}

/**
 * Turns a candidate found in the dataset tree into a full jail record.  This is
 * the expensive part of enumeration.
 */
pub trait JailLoader {
    fn load(&self, candidate: &JailCandidate, dataset: &Dataset)
        -> Result<JailRecord>;
}

fn render(v: &Value) -> Option<String> {
    match v {
        Value::Null => None,
        Value::Bool(true) => Some("yes".to_string()),
        Value::Bool(false) => Some("no".to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.to_string()),
        Value::Array(a) => {
            Some(a.iter().filter_map(render).collect::<Vec<_>>().join(","))
        }
        Value::Object(_) => None,
    }
}

fn flatten(prefix: Option<&str>, v: &Value, out: &mut BTreeMap<String, String>) {
    match v {
        Value::Object(m) => {
            for (k, v) in m.iter() {
                let key = match prefix {
                    Some(p) => format!("{}.{}", p, k),
                    None => k.to_string(),
                };
                flatten(Some(&key), v, out);
            }
        }
        v => {
            if let (Some(key), Some(s)) = (prefix, render(v)) {
                out.insert(key.to_string(), s);
            }
        }
    }
}

/**
 * Parse a jail configuration file.  Nested objects are flattened into dotted
 * keys so that "provisioning.method" may be written either way.
 */
pub fn parse_config(data: &str) -> Result<BTreeMap<String, String>> {
    let v: Value = serde_json::from_str(data)?;
    if !v.is_object() {
        bail!("jail configuration must be a JSON object");
    }

    let mut out = BTreeMap::new();
    flatten(None, &v, &mut out);
    Ok(out)
}

/**
 * Parse "jls -h jid ip4.addr ip6.addr" output.  The first line is the header;
 * the second holds the values, with "-" for an empty parameter.
 */
pub fn parse_jls(out: &str) -> Result<RuntimeState> {
    let mut lines = out.lines().filter(|l| !l.trim().is_empty());

    let header = lines.next()
        .ok_or_else(|| anyhow!("jls produced no output"))?
        .split_whitespace()
        .collect::<Vec<_>>();
    let values = lines.next()
        .ok_or_else(|| anyhow!("jls produced no values"))?
        .split_whitespace()
        .collect::<Vec<_>>();

    if header.len() != values.len() {
        bail!("jls header {:?} does not match values {:?}", header, values);
    }

    let get = |n: &str| -> Option<String> {
        header.iter().position(|h| *h == n)
            .map(|i| values[i])
            .filter(|v| *v != "-" && !v.is_empty())
            .map(str::to_string)
    };

    let jid = get("jid")
        .ok_or_else(|| anyhow!("jls did not report a jid"))?
        .parse::<u32>()
        .context("parsing jid")?;

    Ok(RuntimeState {
        jid,
        ip4_addr: get("ip4.addr"),
        ip6_addr: get("ip6.addr"),
    })
}

/**
 * Loads jails from their dataset on this host: configuration from
 * "config.json" in the dataset, and runtime state from jls(8).
 */
pub struct HostJailLoader;

impl HostJailLoader {
    fn state(&self, identifier: &str) -> Result<Option<RuntimeState>> {
        let cmd = Command::new(JLS)
            .env_clear()
            .arg("-h")
            .arg("-j").arg(identifier)
            .arg("jid")
            .arg("ip4.addr")
            .arg("ip6.addr")
            .output()?;

        if !cmd.status.success() {
            let errmsg = String::from_utf8_lossy(&cmd.stderr);
            if errmsg.trim().ends_with("not found") {
                return Ok(None);
            }
            bail!("jls failed: {}", errmsg);
        }

        Ok(Some(parse_jls(&String::from_utf8(cmd.stdout)?)?))
    }
}

impl JailLoader for HostJailLoader {
    fn load(&self, candidate: &JailCandidate, dataset: &Dataset)
        -> Result<JailRecord>
    {
        let path = dataset.mountpoint()?.join("config.json");
        let data = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config = parse_config(&data)
            .with_context(|| format!("parsing {}", path.display()))?;

        let state = self.state(&candidate.identifier())?;

        Ok(JailRecord::new(&candidate.name, dataset.clone(), config, state))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn dataset() -> Dataset {
        Dataset {
            name: "tank/jails/web1".to_string(),
            mountpoint: Some(PathBuf::from("/jails/web1")),
        }
    }

    #[test]
    fn candidate_name_from_dataset() {
        let c = JailCandidate::from_dataset(&dataset());
        assert_eq!(c.name, "web1");
        assert_eq!(c.identifier(), "ioc-web1");
    }

    #[test]
    fn config_flattened() {
        let c = parse_config(r#"{
            "release": "13.2-RELEASE",
            "boot": true,
            "priority": 5,
            "comment": null,
            "provisioning": {
                "method": "puppet",
                "source.name": "env"
            },
            "provisioning.source": "/srv/puppet-env",
            "tags": ["a", "b"]
        }"#).unwrap();

        assert_eq!(c.get("release").unwrap(), "13.2-RELEASE");
        assert_eq!(c.get("boot").unwrap(), "yes");
        assert_eq!(c.get("priority").unwrap(), "5");
        assert!(c.get("comment").is_none());
        assert_eq!(c.get("provisioning.method").unwrap(), "puppet");
        assert_eq!(c.get("provisioning.source.name").unwrap(), "env");
        assert_eq!(c.get("provisioning.source").unwrap(), "/srv/puppet-env");
        assert_eq!(c.get("tags").unwrap(), "a,b");
    }

    #[test]
    fn config_not_object() {
        assert!(parse_config("[1, 2]").is_err());
        assert!(parse_config("{ broken").is_err());
    }

    #[test]
    fn jls_running() {
        let s = parse_jls("jid ip4.addr ip6.addr\n12 10.0.0.5 -\n").unwrap();
        assert_eq!(s.jid, 12);
        assert_eq!(s.ip4_addr.as_deref(), Some("10.0.0.5"));
        assert!(s.ip6_addr.is_none());
    }

    #[test]
    fn jls_garbage() {
        assert!(parse_jls("").is_err());
        assert!(parse_jls("jid ip4.addr\n12\n").is_err());
        assert!(parse_jls("jid\nabc\n").is_err());
    }

    #[test]
    fn addresses_fall_back_to_config() {
        let mut config = BTreeMap::new();
        config.insert("ip4.addr".to_string(), "192.0.2.1".to_string());

        let stopped = JailRecord::new("web1", dataset(), config.clone(), None);
        assert!(!stopped.running());
        assert!(stopped.jid().is_none());
        assert_eq!(stopped.ip4_addr(), Some("192.0.2.1"));
        assert!(stopped.ip6_addr().is_none());

        let running = JailRecord::new("web1", dataset(), config,
            Some(RuntimeState {
                jid: 3,
                ip4_addr: Some("10.0.0.3".to_string()),
                ip6_addr: None,
            }));
        assert!(running.running());
        assert_eq!(running.jid(), Some(3));
        assert_eq!(running.ip4_addr(), Some("10.0.0.3"));
    }

    #[test]
    fn paths() {
        let j = JailRecord::new("web1", dataset(), BTreeMap::new(), None);
        assert_eq!(j.root_path().unwrap(), PathBuf::from("/jails/web1/root"));
        assert_eq!(j.fstab_path().unwrap(), PathBuf::from("/jails/web1/fstab"));
        assert_eq!(j.launch_scripts_dir().unwrap(),
            PathBuf::from("/jails/web1/launch-scripts"));
    }
}
