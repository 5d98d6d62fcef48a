/*
 * Copyright 2021 Oxide Computer Company
 */

use anyhow::{Context, Result};
use jmclib::log::prelude::*;

use crate::error::{chain, CandidateError};
use crate::filter::Terms;
use crate::jail::{JailCandidate, JailLoader, JailRecord};
use crate::zfs::{Dataset, DatasetStore};

/**
 * Finds the jails that live under one parent dataset.
 */
pub struct Inventory<'a> {
    pub log: Logger,
    pub datasets: &'a dyn DatasetStore,
    pub loader: &'a dyn JailLoader,
    /**
     * The dataset whose children are jails; e.g., "zroot/iocage/jails".
     */
    pub root: String,
}

impl<'a> Inventory<'a> {
    /**
     * Produce the jails that match the filters, loading each one only as the
     * iterator reaches it.  Candidates are first checked by name alone, and
     * are not loaded at all if that does not match.  A jail that fails to load
     * is reported as an error item and the scan carries on.
     */
    pub fn enumerate<'f>(&self, filters: &'f Terms) -> Result<Jails<'a, 'f>> {
        let children = self.datasets.list_children(&self.root)
            .with_context(|| format!("listing jails in {}", self.root))?;

        Ok(Jails {
            loader: self.loader,
            filters,
            children: children.into_iter(),
        })
    }

    /**
     * As per enumerate(), but collect every matching jail before returning.
     * Jails that could not be loaded are logged and left out.
     */
    pub fn enumerate_all(&self, filters: &Terms) -> Result<Vec<JailRecord>> {
        let mut out = Vec::new();

        for res in self.enumerate(filters)? {
            match res {
                Ok(jail) => out.push(jail),
                Err(e) => {
                    warn!(self.log, "skipping jail: {}", chain(&e);
                        "dataset" => &e.dataset);
                }
            }
        }

        Ok(out)
    }
}

/**
 * A single pass over the jail datasets.  See Inventory::enumerate().
 */
pub struct Jails<'a, 'f> {
    loader: &'a dyn JailLoader,
    filters: &'f Terms,
    children: std::vec::IntoIter<Dataset>,
}

impl Iterator for Jails<'_, '_> {
    type Item = Result<JailRecord, CandidateError>;

    fn next(&mut self) -> Option<Self::Item> {
        for ds in self.children.by_ref() {
            let candidate = JailCandidate::from_dataset(&ds);

            if !self.filters.match_key("name", &candidate.name) {
                continue;
            }

            let jail = match self.loader.load(&candidate, &ds) {
                Ok(jail) => jail,
                Err(e) => {
                    return Some(Err(CandidateError {
                        name: candidate.name,
                        dataset: ds.name,
                        source: e.into(),
                    }));
                }
            };

            if self.filters.match_jail(&jail) {
                return Some(Ok(jail));
            }
        }

        None
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use anyhow::bail;
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    struct FakeDatasets {
        children: Option<Vec<&'static str>>,
    }

    impl DatasetStore for FakeDatasets {
        fn list_children(&self, parent: &str) -> Result<Vec<Dataset>> {
            let children = match &self.children {
                Some(c) => c,
                None => bail!("pool is not imported"),
            };

            Ok(children.iter().map(|n| Dataset {
                name: format!("{}/{}", parent, n),
                mountpoint: Some(PathBuf::from(format!("/jails/{}", n))),
            }).collect())
        }

        fn get_or_create(&self, _log: &Logger, _name: &str)
            -> Result<Dataset>
        {
            bail!("not used");
        }
    }

    /*
     * Records every jail it is asked to load.  Jails named "broken*" fail to
     * load; the "db" jails have a different release.
     */
    #[derive(Default)]
    struct FakeLoader {
        loaded: RefCell<Vec<String>>,
    }

    impl JailLoader for FakeLoader {
        fn load(&self, candidate: &JailCandidate, dataset: &Dataset)
            -> Result<JailRecord>
        {
            self.loaded.borrow_mut().push(candidate.name.clone());

            if candidate.name.starts_with("broken") {
                bail!("corrupt config.json");
            }

            let mut config = BTreeMap::new();
            let release = if candidate.name.starts_with("db") {
                "12.4-RELEASE"
            } else {
                "13.2-RELEASE"
            };
            config.insert("release".to_string(), release.to_string());

            Ok(JailRecord::new(&candidate.name, dataset.clone(), config, None))
        }
    }

    fn inventory<'a>(ds: &'a FakeDatasets, loader: &'a FakeLoader)
        -> Inventory<'a>
    {
        Inventory {
            log: jmclib::log::init_log(),
            datasets: ds,
            loader,
            root: "tank/jails".to_string(),
        }
    }

    fn names(jails: &[JailRecord]) -> Vec<&str> {
        jails.iter().map(|j| j.name()).collect()
    }

    #[test]
    fn name_filter_skips_loading() {
        let ds = FakeDatasets { children: Some(vec!["web1", "web2", "db1"]) };
        let loader = FakeLoader::default();
        let inv = inventory(&ds, &loader);
        let filters = Terms::parse(&["web1"]).unwrap();

        let jails = inv.enumerate(&filters).unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(names(&jails), vec!["web1"]);
        assert_eq!(jails[0].dataset().name, "tank/jails/web1");
        assert_eq!(*loader.loaded.borrow(), vec!["web1".to_string()]);
    }

    #[test]
    fn lazy_loading() {
        let ds = FakeDatasets { children: Some(vec!["web1", "web2", "db1"]) };
        let loader = FakeLoader::default();
        let inv = inventory(&ds, &loader);
        let filters = Terms::default();

        let mut it = inv.enumerate(&filters).unwrap();
        assert!(loader.loaded.borrow().is_empty());
        assert_eq!(it.next().unwrap().unwrap().name(), "web1");
        assert_eq!(loader.loaded.borrow().len(), 1);
    }

    #[test]
    fn full_filter_reapplied() {
        let ds = FakeDatasets { children: Some(vec!["web1", "db1", "db2"]) };
        let loader = FakeLoader::default();
        let inv = inventory(&ds, &loader);
        let filters = Terms::parse(&["release=13.*"]).unwrap();

        let jails = inv.enumerate_all(&filters).unwrap();
        assert_eq!(names(&jails), vec!["web1"]);

        /*
         * Nothing could be ruled out by name, so everything was loaded.
         */
        assert_eq!(loader.loaded.borrow().len(), 3);
    }

    #[test]
    fn order_follows_store() {
        let ds = FakeDatasets { children: Some(vec!["zeta", "alpha", "mid"]) };
        let loader = FakeLoader::default();
        let inv = inventory(&ds, &loader);

        let jails = inv.enumerate_all(&Terms::default()).unwrap();
        assert_eq!(names(&jails), vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn candidate_errors_do_not_stop_scan() {
        let ds = FakeDatasets {
            children: Some(vec!["web1", "broken1", "web2"]),
        };
        let loader = FakeLoader::default();
        let inv = inventory(&ds, &loader);
        let filters = Terms::default();

        let results = inv.enumerate(&filters).unwrap().collect::<Vec<_>>();
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        let e = results[1].as_ref().unwrap_err();
        assert_eq!(e.name, "broken1");
        assert_eq!(e.dataset, "tank/jails/broken1");
        assert!(results[2].is_ok());

        let jails = inv.enumerate_all(&filters).unwrap();
        assert_eq!(names(&jails), vec!["web1", "web2"]);
    }

    #[test]
    fn broken_jail_filtered_by_name_is_not_loaded() {
        let ds = FakeDatasets {
            children: Some(vec!["web1", "broken1"]),
        };
        let loader = FakeLoader::default();
        let inv = inventory(&ds, &loader);
        let filters = Terms::parse(&["name=web*"]).unwrap();

        let results = inv.enumerate(&filters).unwrap().collect::<Vec<_>>();
        assert_eq!(results.len(), 1);
        assert!(results[0].is_ok());
    }

    #[test]
    fn store_unavailable() {
        let ds = FakeDatasets { children: None };
        let loader = FakeLoader::default();
        let inv = inventory(&ds, &loader);

        assert!(inv.enumerate(&Terms::default()).is_err());
        assert!(inv.enumerate_all(&Terms::default()).is_err());
        assert!(loader.loaded.borrow().is_empty());
    }
}
