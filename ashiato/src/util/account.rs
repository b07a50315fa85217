//! Name resolution for user and group ids, backed by the colon separated
//! account databases (`/etc/passwd`, `/etc/group`).
use std::{
    collections::HashMap,
    fs::File,
    io::{self, BufRead, BufReader},
    num::ParseIntError,
    path::Path,
    str::FromStr,
};

use log::warn;
use thiserror::Error;

const PASSWD: &str = "/etc/passwd";
const GROUP: &str = "/etc/group";

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("bad line format")]
    BadLineFormat,
    #[error("parse id error: {0}")]
    ParseId(ParseIntError),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("line {0}: {1}")]
    Parse(usize, ParseError),
}

/// A `name:password:id:...` record. Both passwd and group lines share
/// the position of the name and of the numeric id.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub name: String,
    pub id: u32,
}

impl FromStr for Entry {
    type Err = ParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields = s.split(':').collect::<Vec<&str>>();
        if fields.len() < 3 {
            return Err(ParseError::BadLineFormat);
        }

        Ok(Self {
            name: fields[0].into(),
            id: fields[2].parse::<u32>().map_err(ParseError::ParseId)?,
        })
    }
}

/// Id to name table built from one account database
#[derive(Debug, Default, Clone)]
pub struct Table {
    by_id: HashMap<u32, String>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend_from_reader<R: io::Read>(&mut self, r: R) -> Result<&mut Self, Error> {
        let r = BufReader::new(r);
        for (i, res) in r.lines().enumerate() {
            let line = res?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let e = Entry::from_str(line).map_err(|e| Error::Parse(i + 1, e))?;
            // first entry wins, like getpwuid does
            self.by_id.entry(e.id).or_insert(e.name);
        }
        Ok(self)
    }

    pub fn extend_from_str<S: AsRef<str>>(&mut self, s: S) -> Result<&mut Self, Error> {
        self.extend_from_reader(io::Cursor::new(s.as_ref()))
    }

    pub fn extend_from_file<P: AsRef<Path>>(&mut self, p: P) -> Result<&mut Self, Error> {
        self.extend_from_reader(File::open(p.as_ref())?)
    }

    #[inline(always)]
    pub fn name(&self, id: u32) -> Option<&str> {
        self.by_id.get(&id).map(|s| s.as_str())
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

/// Users and groups of the host
#[derive(Debug, Default, Clone)]
pub struct Accounts {
    users: Table,
    groups: Table,
}

impl Accounts {
    pub fn new(users: Table, groups: Table) -> Self {
        Self { users, groups }
    }

    /// Loads the system databases. A database which cannot be read is
    /// logged and left empty, names are then simply not resolved.
    pub fn from_sys() -> Self {
        let mut out = Self::default();
        if let Err(e) = out.users.extend_from_file(PASSWD) {
            warn!("failed to load users from {PASSWD}: {e}");
        }
        if let Err(e) = out.groups.extend_from_file(GROUP) {
            warn!("failed to load groups from {GROUP}: {e}");
        }
        out
    }

    #[inline(always)]
    pub fn user_name(&self, uid: u32) -> Option<&str> {
        self.users.name(uid)
    }

    #[inline(always)]
    pub fn group_name(&self, gid: u32) -> Option<&str> {
        self.groups.name(gid)
    }
}
