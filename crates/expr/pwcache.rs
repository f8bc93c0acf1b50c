//! User and group lookups, cached in tries.
//!
//! Resolution goes through `getpwnam`/`getgrnam` once per distinct key;
//! repeat queries (every entry of a large tree asking about the same
//! handful of ids) hit the trie. Negative results are cached too, which is
//! what makes `-nouser` over a big tree bearable.

use std::ffi::{CStr, CString};

use bfs_trie::QpTrie;

#[derive(Default)]
pub struct Users {
    by_name: QpTrie<Option<u32>>,
    by_id: QpTrie<Option<String>>,
}

impl Users {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uid for a user name, if the name resolves.
    pub fn id_for(&mut self, name: &str) -> Option<u32> {
        let key = name.as_bytes();
        if let Some(leaf) = self.by_name.find_exact(key) {
            return *self.by_name.value(leaf);
        }
        let resolved = lookup_uid(name);
        self.by_name.insert(key, resolved);
        resolved
    }

    /// User name for a uid, if one exists.
    pub fn name_for(&mut self, uid: u32) -> Option<String> {
        let key = uid.to_string();
        if let Some(leaf) = self.by_id.find_exact(key.as_bytes()) {
            return self.by_id.value(leaf).clone();
        }
        let resolved = lookup_user_name(uid);
        self.by_id.insert(key.as_bytes(), resolved.clone());
        resolved
    }
}

#[derive(Default)]
pub struct Groups {
    by_name: QpTrie<Option<u32>>,
    by_id: QpTrie<Option<String>>,
}

impl Groups {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id_for(&mut self, name: &str) -> Option<u32> {
        let key = name.as_bytes();
        if let Some(leaf) = self.by_name.find_exact(key) {
            return *self.by_name.value(leaf);
        }
        let resolved = lookup_gid(name);
        self.by_name.insert(key, resolved);
        resolved
    }

    pub fn name_for(&mut self, gid: u32) -> Option<String> {
        let key = gid.to_string();
        if let Some(leaf) = self.by_id.find_exact(key.as_bytes()) {
            return self.by_id.value(leaf).clone();
        }
        let resolved = lookup_group_name(gid);
        self.by_id.insert(key.as_bytes(), resolved.clone());
        resolved
    }
}

fn lookup_uid(name: &str) -> Option<u32> {
    let cname = CString::new(name).ok()?;
    let pw = unsafe { libc::getpwnam(cname.as_ptr()) };
    if pw.is_null() {
        None
    } else {
        Some(unsafe { (*pw).pw_uid })
    }
}

fn lookup_user_name(uid: u32) -> Option<String> {
    let pw = unsafe { libc::getpwuid(uid) };
    if pw.is_null() {
        return None;
    }
    let name = unsafe { CStr::from_ptr((*pw).pw_name) };
    Some(name.to_string_lossy().into_owned())
}

fn lookup_gid(name: &str) -> Option<u32> {
    let cname = CString::new(name).ok()?;
    let gr = unsafe { libc::getgrnam(cname.as_ptr()) };
    if gr.is_null() {
        None
    } else {
        Some(unsafe { (*gr).gr_gid })
    }
}

fn lookup_group_name(gid: u32) -> Option<String> {
    let gr = unsafe { libc::getgrgid(gid) };
    if gr.is_null() {
        return None;
    }
    let name = unsafe { CStr::from_ptr((*gr).gr_name) };
    Some(name.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_resolves_both_ways() {
        let mut users = Users::new();
        assert_eq!(users.id_for("root"), Some(0));
        assert_eq!(users.name_for(0).as_deref(), Some("root"));
        // Cached round trip returns the same answers.
        assert_eq!(users.id_for("root"), Some(0));
        assert_eq!(users.name_for(0).as_deref(), Some("root"));
    }

    #[test]
    fn unknown_names_cache_their_absence() {
        let mut users = Users::new();
        assert_eq!(users.id_for("no-such-user-here"), None);
        assert_eq!(users.id_for("no-such-user-here"), None);
        let mut groups = Groups::new();
        assert_eq!(groups.id_for("no-such-group-here"), None);
    }
}
