/*
 * Copyright © 2023 Collabora Ltd.
 * Copyright © 2024 Valve Software
 *
 * SPDX-License-Identifier: MIT
 */

use async_trait::async_trait;
use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Mutex;
use tempfile::{tempdir, TempDir};
use tokio::fs::{create_dir_all, write};

use crate::error::SysfsError;
use crate::sysfs::ValueStore;

thread_local! {
    static TEST: RefCell<Option<Rc<Test>>> = const { RefCell::new(None) };
}

#[must_use]
pub fn start() -> TestHandle {
    TEST.with(|lock| {
        assert!(lock.borrow().as_ref().is_none());
        let test: Rc<Test> = Rc::new(Test {
            base: tempdir().expect("Couldn't create test directory"),
        });
        *lock.borrow_mut() = Some(test.clone());
        TestHandle { test }
    })
}

pub fn stop() {
    TEST.with(|lock| {
        *lock.borrow_mut() = None;
    });
}

pub fn current() -> Rc<Test> {
    TEST.with(|lock| lock.borrow().as_ref().expect("No test running").clone())
}

pub struct Test {
    base: TempDir,
}

pub struct TestHandle {
    pub test: Rc<Test>,
}

impl Test {
    pub fn path(&self) -> &Path {
        self.base.path()
    }
}

impl Drop for TestHandle {
    fn drop(&mut self) {
        stop();
    }
}

/// Creates `file` (and its directory) under the test root with `contents`.
pub async fn write_node(file: impl AsRef<Path>, contents: &str) -> anyhow::Result<()> {
    let file = crate::path(file);
    if let Some(parent) = file.parent() {
        create_dir_all(parent).await?;
    }
    write(file, contents).await?;
    Ok(())
}

/// In-memory store that records every write and can be told to fail them.
#[derive(Default)]
pub struct FakeStore {
    values: Mutex<HashMap<PathBuf, i64>>,
    writes: Mutex<Vec<(PathBuf, i64)>>,
    fail_writes: Mutex<bool>,
    reject: Mutex<Option<fn(&Path, i64, &HashMap<PathBuf, i64>) -> bool>>,
}

impl FakeStore {
    pub fn with_values<'a>(values: impl IntoIterator<Item = (&'a Path, i64)>) -> FakeStore {
        let store = FakeStore::default();
        store.values.lock().unwrap().extend(
            values
                .into_iter()
                .map(|(path, value)| (path.to_path_buf(), value)),
        );
        store
    }

    pub fn fail_writes(&self, fail: bool) {
        *self.fail_writes.lock().unwrap() = fail;
    }

    /// Rejects writes for which `reject` returns true, like a driver
    /// refusing a value that conflicts with the other file's current value.
    pub fn reject_with(&self, reject: fn(&Path, i64, &HashMap<PathBuf, i64>) -> bool) {
        *self.reject.lock().unwrap() = Some(reject);
    }

    pub fn value(&self, path: &Path) -> Option<i64> {
        self.values.lock().unwrap().get(path).copied()
    }

    /// Every attempted write, successful or not, in order.
    pub fn writes(&self) -> Vec<(PathBuf, i64)> {
        self.writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl ValueStore for FakeStore {
    async fn read_int(&self, path: &Path) -> Option<i64> {
        self.value(path)
    }

    async fn write_int(&self, path: &Path, value: i64) -> Result<(), SysfsError> {
        self.writes
            .lock()
            .unwrap()
            .push((path.to_path_buf(), value));
        let failed = *self.fail_writes.lock().unwrap();
        let mut values = self.values.lock().unwrap();
        let rejected = self
            .reject
            .lock()
            .unwrap()
            .is_some_and(|reject| reject(path, value, &*values));
        if failed || rejected {
            return Err(SysfsError::Write {
                path: path.to_path_buf(),
                source: io::Error::from(io::ErrorKind::PermissionDenied),
            });
        }
        values.insert(path.to_path_buf(), value);
        Ok(())
    }
}
