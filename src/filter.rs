/*
 * Copyright 2021 Oxide Computer Company
 */

use anyhow::{bail, Context, Result};
use glob::Pattern;

use crate::jail::JailRecord;

/*
 * Attributes resolved from the jail itself rather than from its
 * configuration.  Any key not listed here is looked up in the configuration.
 */
type Resolver = fn(&JailRecord) -> Option<String>;

fn jid(j: &JailRecord) -> Option<String> {
    j.jid().map(|jid| jid.to_string())
}

fn name(j: &JailRecord) -> Option<String> {
    Some(j.name().to_string())
}

fn running(j: &JailRecord) -> Option<String> {
    Some(if j.running() { "yes" } else { "no" }.to_string())
}

fn ip4_addr(j: &JailRecord) -> Option<String> {
    j.ip4_addr().map(str::to_string)
}

fn ip6_addr(j: &JailRecord) -> Option<String> {
    j.ip6_addr().map(str::to_string)
}

const RUNTIME_KEYS: &[(&str, Resolver)] = &[
    ("jid", jid as Resolver),
    ("name", name as Resolver),
    ("running", running as Resolver),
    ("ip4.addr", ip4_addr as Resolver),
    ("ip6.addr", ip6_addr as Resolver),
];

/**
 * Look up an attribute of a jail by key.  Returns None if the jail has no
 * value for it.
 */
pub fn resolve(key: &str, jail: &JailRecord) -> Option<String> {
    if let Some((_, f)) = RUNTIME_KEYS.iter().find(|(k, _)| *k == key) {
        f(jail)
    } else {
        jail.config_value(key).map(str::to_string)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Equal,
    NotEqual,
}

#[derive(Debug, Clone)]
pub struct Term {
    key: String,
    op: Op,
    values: Vec<Pattern>,
}

impl Term {
    pub fn new(key: &str, op: Op, values: &[&str]) -> Result<Term> {
        if key.is_empty() {
            bail!("filter key must not be empty");
        }
        if values.is_empty() || values.iter().any(|v| v.is_empty()) {
            bail!("filter for {:?} needs a value", key);
        }

        let values = values.iter()
            .map(|v| {
                Pattern::new(v)
                    .with_context(|| format!("invalid pattern {:?}", v))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Term {
            key: key.to_string(),
            op,
            values,
        })
    }

    /**
     * Parse "key=value", "key!=value", or a bare "value" which selects by
     * name.  The value may list alternatives separated by commas.
     */
    pub fn parse(spec: &str) -> Result<Term> {
        /*
         * The first "=" ends the key; it belongs to "!=" if a "!" comes right
         * before it.  Anything after that is value.
         */
        let (key, op, value) = match spec.find('=') {
            Some(i) if spec[..i].ends_with('!') => {
                (&spec[..i - 1], Op::NotEqual, &spec[i + 1..])
            }
            Some(i) => (&spec[..i], Op::Equal, &spec[i + 1..]),
            None => ("name", Op::Equal, spec),
        };

        let values = value.split(',').collect::<Vec<_>>();
        Term::new(key.trim(), op, &values)
            .with_context(|| format!("parsing filter {:?}", spec))
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /**
     * Match a resolved attribute value.  An attribute that did not resolve
     * never matches, whatever the operator.
     */
    pub fn matches_value(&self, value: Option<&str>) -> bool {
        let value = match value {
            Some(v) => v,
            None => return false,
        };

        let any = self.values.iter().any(|p| p.matches(value));
        match self.op {
            Op::Equal => any,
            Op::NotEqual => !any,
        }
    }

    pub fn matches(&self, jail: &JailRecord) -> bool {
        self.matches_value(resolve(&self.key, jail).as_deref())
    }
}

/**
 * A set of filter terms, all of which must match for a jail to be selected.
 * An empty set selects everything.
 */
#[derive(Debug, Clone, Default)]
pub struct Terms {
    terms: Vec<Term>,
}

impl Terms {
    pub fn parse<S: AsRef<str>>(specs: &[S]) -> Result<Terms> {
        let terms = specs.iter()
            .map(|s| Term::parse(s.as_ref()))
            .collect::<Result<Vec<_>>>()?;

        Ok(Terms { terms })
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /**
     * Check a single attribute ahead of loading the jail.  Only terms for this
     * key are considered, so a true result does not mean the jail as a whole
     * will match.
     */
    pub fn match_key(&self, key: &str, value: &str) -> bool {
        self.terms.iter()
            .filter(|t| t.key() == key)
            .all(|t| t.matches_value(Some(value)))
    }

    pub fn match_jail(&self, jail: &JailRecord) -> bool {
        self.terms.iter().all(|t| t.matches(jail))
    }
}
