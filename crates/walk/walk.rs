//! Breadth-first directory traversal driven through the asynchronous I/O
//! queue.
//!
//! The scheduler is single-threaded: it issues directory opens and reads to
//! the [`IoQueue`], drains completions, and offers visit records to a
//! consumer callback in strict level order (directory-before-contents, or
//! contents-before-directory in post-order mode). Only the I/O itself is
//! parallel.

mod entry;

pub use entry::{Visit, WalkAction, WalkEntry};

use std::collections::{HashMap, VecDeque};
use std::io;
use std::mem::MaybeUninit;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use bfs_arena::{Pool, SlotId};
use bfs_common::{Dirent, FileKind, Stat, stat_at, to_cstring};
use bfs_ioq::{DirStream, IoQueue, Payload, Request, Response};
use tracing::{debug, trace};

/// Symlink-following policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Follow {
    /// Never resolve symlinks (`-P`).
    Never,
    /// Resolve symlinks given as roots only (`-H`).
    Roots,
    /// Resolve all symlinks (`-L`); enables cycle detection.
    Always,
}

/// Order in which directories are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Level order.
    Bfs,
    /// Children before later siblings.
    Dfs,
    /// Iterative deepening: one level per pass.
    Ids,
    /// Exponential deepening: geometrically growing depth windows.
    Eds,
}

#[derive(Debug, Clone)]
pub struct WalkOptions {
    pub mindepth: usize,
    pub maxdepth: usize,
    pub follow: Follow,
    /// Do not descend past mount points.
    pub xdev: bool,
    /// Offer directories after their contents.
    pub post_order: bool,
    pub strategy: Strategy,
    /// Sort siblings by name instead of readdir order.
    pub sort: bool,
    /// Ceiling on simultaneously open directory handles.
    pub nopenfd: usize,
    /// I/O worker threads; zero services requests on the calling thread.
    pub threads: usize,
    /// Capacity of the I/O queue.
    pub queue_depth: usize,
    /// Suppress ENOENT errors from entries that vanish mid-walk.
    pub ignore_races: bool,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            mindepth: 0,
            maxdepth: usize::MAX,
            follow: Follow::Never,
            xdev: false,
            post_order: false,
            strategy: Strategy::Bfs,
            sort: false,
            nopenfd: 256,
            threads: 1,
            queue_depth: 64,
            ignore_races: false,
        }
    }
}

/// Walk `roots`, offering every in-scope entry to `consumer`.
///
/// Per-entry failures are delivered in-band as [`FileKind::Error`] visits;
/// only configuration-level problems (a root path with a NUL byte) surface
/// here.
pub fn walk<F>(roots: &[PathBuf], opts: &WalkOptions, mut consumer: F) -> io::Result<()>
where
    F: FnMut(&mut WalkEntry) -> WalkAction,
{
    let mut queue = IoQueue::new(opts.queue_depth.max(1), opts.threads);
    match opts.strategy {
        Strategy::Bfs | Strategy::Dfs => {
            let mut pass = Pass::new(opts, &mut queue, &mut consumer, opts.maxdepth, 0);
            pass.run(roots)?;
            Ok(())
        }
        Strategy::Ids => {
            let mut depth = 0;
            loop {
                debug!(target: "search", "iterative pass at depth {depth}");
                let limit = depth.min(opts.maxdepth);
                let mut pass = Pass::new(opts, &mut queue, &mut consumer, limit, depth);
                let outcome = pass.run(roots)?;
                if outcome.stopped || !outcome.saw_dir_at_limit || limit >= opts.maxdepth {
                    return Ok(());
                }
                depth += 1;
            }
        }
        Strategy::Eds => {
            let mut lo = 0;
            let mut hi = 1usize;
            loop {
                debug!(target: "search", "exponential pass for depths {lo}..={hi}");
                let limit = hi.min(opts.maxdepth);
                let mut pass = Pass::new(opts, &mut queue, &mut consumer, limit, lo);
                let outcome = pass.run(roots)?;
                if outcome.stopped || !outcome.saw_dir_at_limit || limit >= opts.maxdepth {
                    return Ok(());
                }
                lo = hi + 1;
                hi *= 2;
            }
        }
    }
}

struct Outcome {
    stopped: bool,
    /// A directory sat exactly at the recursion limit, so a deeper pass
    /// could find more.
    saw_dir_at_limit: bool,
}

enum DirState {
    /// Waiting for its open to be issued.
    Queued,
    /// Open request in flight.
    Opening,
    /// Read request in flight.
    Reading,
    /// A batch of entries awaiting processing at the front of the order.
    Batch {
        dir: DirStream,
        entries: Vec<Dirent>,
        done: bool,
    },
    /// No more batches are coming.
    Done,
}

struct DirRecord {
    parent: Option<SlotId>,
    /// Live child directory records below this one.
    children: usize,
    /// An open/read/close request is in flight.
    pending_op: bool,
    /// Fully processed and removed from the visit order.
    processed: bool,
    depth: usize,
    path: PathBuf,
    dev: u64,
    ino: u64,
    root_dev: u64,
    root_len: usize,
    fd: Option<RawFd>,
    state: DirState,
    cancelled: bool,
    skip_siblings: bool,
    fail: Option<i32>,
    /// Accumulated entries when sorting siblings.
    buffer: Vec<Dirent>,
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Open,
    Read,
    Close,
}

struct Pass<'a, F> {
    opts: &'a WalkOptions,
    queue: &'a mut IoQueue,
    consumer: &'a mut F,
    records: Pool<DirRecord>,
    /// Directory records in visit order; the front is processed next.
    dirs: VecDeque<SlotId>,
    /// Subset of `dirs` still waiting for their open, same relative order.
    to_open: VecDeque<SlotId>,
    cookies: HashMap<u64, (Op, SlotId)>,
    next_cookie: u64,
    open_fds: usize,
    /// Queue slots owed to batches whose follow-up request is not yet issued.
    reserved: usize,
    stopping: bool,
    recurse_limit: usize,
    visit_min: usize,
    visit_max: usize,
    saw_dir_at_limit: bool,
}

impl<'a, F> Pass<'a, F>
where
    F: FnMut(&mut WalkEntry) -> WalkAction,
{
    fn new(
        opts: &'a WalkOptions,
        queue: &'a mut IoQueue,
        consumer: &'a mut F,
        recurse_limit: usize,
        window_lo: usize,
    ) -> Self {
        Self {
            opts,
            queue,
            consumer,
            records: Pool::new(),
            dirs: VecDeque::new(),
            to_open: VecDeque::new(),
            cookies: HashMap::new(),
            next_cookie: 0,
            open_fds: 0,
            reserved: 0,
            stopping: false,
            recurse_limit,
            visit_min: window_lo.max(opts.mindepth),
            visit_max: recurse_limit.min(opts.maxdepth),
            saw_dir_at_limit: false,
        }
    }

    fn run(&mut self, roots: &[PathBuf]) -> io::Result<Outcome> {
        for root in roots {
            if self.stopping {
                break;
            }
            self.visit_root(root)?;
        }
        self.event_loop();
        self.drain();
        Ok(Outcome {
            stopped: self.stopping,
            saw_dir_at_limit: self.saw_dir_at_limit,
        })
    }

    fn visit_root(&mut self, root: &Path) -> io::Result<()> {
        let cpath = to_cstring(root.as_os_str())?;
        let follow = self.opts.follow != Follow::Never;
        let stat = stat_at(None, &cpath, follow).or_else(|e| {
            if follow && matches!(e.raw_os_error(), Some(libc::ENOENT) | Some(libc::ELOOP)) {
                stat_at(None, &cpath, false)
            } else {
                Err(e)
            }
        });
        let stat = match stat {
            Ok(stat) => stat,
            Err(e) => {
                let errno = e.raw_os_error().unwrap_or(libc::EIO);
                let mut entry = WalkEntry::new(
                    root.to_path_buf(),
                    0,
                    FileKind::Unknown,
                    Visit::Pre,
                    None,
                    root.as_os_str().to_os_string(),
                    None,
                    root.as_os_str().len(),
                    follow,
                )
                .with_error(errno);
                self.offer(&mut entry);
                return Ok(());
            }
        };

        let kind = stat.kind();
        let is_dir = kind.is_dir();
        let recursed = is_dir && self.recurse_limit > 0;
        if is_dir && self.recurse_limit == 0 {
            self.saw_dir_at_limit = true;
        }

        let record = recursed.then(|| {
            let id = self.records.alloc(DirRecord {
                parent: None,
                children: 0,
                pending_op: false,
                processed: false,
                depth: 0,
                path: root.to_path_buf(),
                dev: stat.dev,
                ino: stat.ino,
                root_dev: stat.dev,
                root_len: root.as_os_str().len(),
                fd: None,
                state: DirState::Queued,
                cancelled: false,
                skip_siblings: false,
                fail: None,
                buffer: Vec::new(),
            });
            self.dirs.push_back(id);
            self.to_open.push_back(id);
            id
        });

        let mut entry = WalkEntry::new(
            root.to_path_buf(),
            0,
            kind,
            Visit::Pre,
            None,
            root.as_os_str().to_os_string(),
            Some(stat.dev),
            root.as_os_str().len(),
            follow,
        );
        entry.prime_stat(follow, stat);
        match self.offer(&mut entry) {
            WalkAction::SkipSubtree => {
                if let Some(id) = record {
                    self.records.get_mut(id).cancelled = true;
                }
            }
            WalkAction::Continue | WalkAction::SkipSiblings | WalkAction::Stop => {}
        }
        if self.opts.post_order && is_dir && record.is_none() && !self.stopping {
            let mut post = WalkEntry::new(
                root.to_path_buf(),
                0,
                kind,
                Visit::Post,
                None,
                root.as_os_str().to_os_string(),
                Some(stat.dev),
                root.as_os_str().len(),
                follow,
            );
            self.offer(&mut post);
        }
        Ok(())
    }

    fn event_loop(&mut self) {
        loop {
            if self.stopping {
                return;
            }
            self.issue_opens(false);
            self.process_front();
            if self.stopping {
                return;
            }
            if self.dirs.is_empty() && self.cookies.is_empty() {
                return;
            }
            if self.cookies.is_empty() {
                // Without a cookie every record is Queued, Batch, or Done,
                // and the front was not processable, so it must be Queued
                // with the open held back by the fd budget. Overshoot the
                // budget by one to keep making progress.
                self.issue_opens(true);
                continue;
            }
            self.queue.submit();
            if let Some(response) = self.queue.pop(true) {
                self.handle_response(response);
            }
            while !self.stopping {
                match self.queue.pop(false) {
                    Some(response) => self.handle_response(response),
                    None => break,
                }
            }
        }
    }

    /// Issue opens for queued directories while budget allows. `force`
    /// issues a single open for the front record regardless of the fd cap.
    fn issue_opens(&mut self, force: bool) {
        loop {
            if self.to_open.is_empty() {
                return;
            }
            if self.queue.capacity() <= self.reserved {
                return;
            }
            if !force && self.open_fds >= self.opts.nopenfd {
                return;
            }
            let id = self.to_open.pop_front().unwrap();
            let record = self.records.get_mut(id);
            if record.cancelled {
                record.state = DirState::Done;
                continue;
            }
            let path = match to_cstring(record.path.as_os_str()) {
                Ok(path) => path,
                Err(_) => {
                    record.fail = Some(libc::EINVAL);
                    record.state = DirState::Done;
                    continue;
                }
            };
            trace!(target: "search", "opening {:?}", record.path);
            record.state = DirState::Opening;
            record.pending_op = true;
            self.open_fds += 1;
            let cookie = self.cookie(Op::Open, id);
            self.queue
                .push(cookie, Request::OpenDir { dirfd: None, path })
                .unwrap_or_else(|_| unreachable!("open pushed past reserved capacity"));
            if force {
                return;
            }
        }
    }

    /// Process records at the front of the visit order for as long as they
    /// have something ready.
    fn process_front(&mut self) {
        while let Some(&front) = self.dirs.front() {
            if self.stopping {
                return;
            }
            {
                // A Queued record (cancelled or not) still owns a slot in
                // to_open; issue_opens is the only place that takes it out.
                let record = self.records.get(front);
                if matches!(
                    record.state,
                    DirState::Queued | DirState::Opening | DirState::Reading
                ) {
                    return;
                }
            }
            match std::mem::replace(&mut self.records.get_mut(front).state, DirState::Done) {
                DirState::Batch { dir, entries, done } => {
                    self.reserved -= 1;
                    self.process_batch(front, dir, entries, done);
                }
                DirState::Done => {
                    let errno = self.records.get_mut(front).fail.take();
                    if let Some(errno) = errno {
                        if !(self.opts.ignore_races && errno == libc::ENOENT) {
                            let (path, depth, root_dev, root_len) = {
                                let record = self.records.get(front);
                                (
                                    record.path.clone(),
                                    record.depth,
                                    record.root_dev,
                                    record.root_len,
                                )
                            };
                            let mut entry = WalkEntry::new(
                                path.clone(),
                                depth,
                                FileKind::Directory,
                                Visit::Pre,
                                None,
                                path.into_os_string(),
                                Some(root_dev),
                                root_len,
                                self.opts.follow == Follow::Always,
                            )
                            .with_error(errno);
                            self.offer(&mut entry);
                        }
                    }
                    self.dirs.pop_front();
                    self.records.get_mut(front).processed = true;
                    self.maybe_retire(front);
                }
                _ => unreachable!("front record changed state mid-processing"),
            }
        }
    }

    fn process_batch(
        &mut self,
        id: SlotId,
        dir: DirStream,
        entries: Vec<Dirent>,
        done: bool,
    ) {
        let (dir_path, dir_depth, dir_fd, root_dev, root_len) = {
            let record = self.records.get(id);
            (
                record.path.clone(),
                record.depth,
                record.fd,
                record.root_dev,
                record.root_len,
            )
        };
        let follow = self.opts.follow == Follow::Always;
        let mut new_children = Vec::new();

        for dirent in entries {
            if self.stopping || self.records.get(id).skip_siblings {
                break;
            }
            let name_bytes = dirent.name.as_bytes();
            if name_bytes == b"." || name_bytes == b".." {
                continue;
            }
            let depth = dir_depth + 1;
            let path = dir_path.join(&dirent.name);
            let mut entry = WalkEntry::new(
                path.clone(),
                depth,
                dirent.kind,
                Visit::Pre,
                dir_fd,
                dirent.name.clone(),
                Some(root_dev),
                root_len,
                follow,
            );

            // Resolve whether this entry recurses; unknown d_types and
            // symlinks under a following policy need a stat for that.
            let mut is_dir = dirent.kind.is_dir();
            if !is_dir
                && depth <= self.recurse_limit
                && (dirent.kind == FileKind::Unknown
                    || (dirent.kind == FileKind::Symlink && follow))
            {
                if let Some(kind) = entry.stat().ok().map(|stat| stat.kind()) {
                    is_dir = kind.is_dir();
                    if dirent.kind == FileKind::Unknown {
                        entry.set_kind(kind);
                    }
                }
            }

            let child = if is_dir && depth < self.recurse_limit {
                Some(self.make_child(id, path.clone(), depth, root_dev))
            } else {
                if is_dir && depth == self.recurse_limit {
                    self.saw_dir_at_limit = true;
                }
                None
            };

            match self.offer(&mut entry) {
                WalkAction::Continue => {}
                WalkAction::SkipSubtree => {
                    if let Some(child) = child {
                        self.records.get_mut(child).cancelled = true;
                    }
                }
                WalkAction::SkipSiblings => {
                    self.records.get_mut(id).skip_siblings = true;
                }
                WalkAction::Stop => {}
            }

            // Directories that do not recurse still owe their post visit.
            if self.opts.post_order && is_dir && child.is_none() && !self.stopping {
                let mut post = WalkEntry::new(
                    path,
                    depth,
                    FileKind::Directory,
                    Visit::Post,
                    dir_fd,
                    dirent.name,
                    Some(root_dev),
                    root_len,
                    follow,
                );
                self.offer(&mut post);
            }

            match self.opts.strategy {
                Strategy::Dfs => new_children.extend(child),
                _ => {
                    if let Some(child) = child {
                        self.dirs.push_back(child);
                        self.to_open.push_back(child);
                    }
                }
            }
        }

        // Depth-first: children go in front of everything, keeping their
        // sibling order.
        for &child in new_children.iter().rev() {
            self.dirs.push_front(child);
            self.to_open.push_front(child);
        }

        if self.stopping {
            drop(dir);
            self.open_fds -= 1;
            self.records.get_mut(id).fd = None;
            return;
        }

        if done {
            let cookie = self.cookie(Op::Close, id);
            let record = self.records.get_mut(id);
            record.state = DirState::Done;
            record.pending_op = true;
            self.queue
                .push(cookie, Request::CloseDir { dir })
                .unwrap_or_else(|_| unreachable!("close pushed past reserved capacity"));
        } else {
            let cookie = self.cookie(Op::Read, id);
            let record = self.records.get_mut(id);
            record.state = DirState::Reading;
            record.pending_op = true;
            self.queue
                .push(cookie, Request::ReadDir { dir })
                .unwrap_or_else(|_| unreachable!("read pushed past reserved capacity"));
        }
    }

    fn make_child(
        &mut self,
        parent: SlotId,
        path: PathBuf,
        depth: usize,
        root_dev: u64,
    ) -> SlotId {
        let root_len = self.records.get(parent).root_len;
        self.records.get_mut(parent).children += 1;
        self.records.alloc(DirRecord {
            parent: Some(parent),
            children: 0,
            pending_op: false,
            processed: false,
            depth,
            path,
            dev: 0,
            ino: 0,
            root_dev,
            root_len,
            fd: None,
            state: DirState::Queued,
            cancelled: false,
            skip_siblings: false,
            fail: None,
            buffer: Vec::new(),
        })
    }

    fn handle_response(&mut self, response: Response) {
        let (op, id) = self
            .cookies
            .remove(&response.cookie)
            .expect("completion for an unknown cookie");
        match op {
            Op::Open => {
                self.records.get_mut(id).pending_op = false;
                match response.payload {
                    Ok(Payload::Dir(dir)) => self.dir_opened(id, dir),
                    Ok(_) => unreachable!("open completed with a foreign payload"),
                    Err(e) => {
                        self.open_fds -= 1;
                        let record = self.records.get_mut(id);
                        record.fail = Some(e.raw_os_error().unwrap_or(libc::EIO));
                        record.state = DirState::Done;
                    }
                }
            }
            Op::Read => {
                self.records.get_mut(id).pending_op = false;
                match response.payload {
                    Ok(Payload::Entries { dir, entries, done }) => {
                        if self.opts.sort {
                            self.records.get_mut(id).buffer.extend(entries);
                            if !done {
                                let cookie = self.cookie(Op::Read, id);
                                self.records.get_mut(id).pending_op = true;
                                self.queue
                                    .push(cookie, Request::ReadDir { dir })
                                    .unwrap_or_else(|_| {
                                        unreachable!("read reissued past freed slot")
                                    });
                                return;
                            }
                            let mut entries = std::mem::take(&mut self.records.get_mut(id).buffer);
                            entries.sort_by(|a, b| a.name.cmp(&b.name));
                            self.records.get_mut(id).state = DirState::Batch {
                                dir,
                                entries,
                                done: true,
                            };
                        } else {
                            self.records.get_mut(id).state = DirState::Batch { dir, entries, done };
                        }
                        self.reserved += 1;
                    }
                    Ok(_) => unreachable!("read completed with a foreign payload"),
                    Err(e) => {
                        // The worker dropped the stream, closing its fd.
                        self.open_fds -= 1;
                        let record = self.records.get_mut(id);
                        record.fd = None;
                        record.fail = Some(e.raw_os_error().unwrap_or(libc::EIO));
                        record.state = DirState::Done;
                    }
                }
            }
            Op::Close => {
                self.open_fds -= 1;
                let record = self.records.get_mut(id);
                record.pending_op = false;
                record.fd = None;
                self.maybe_retire(id);
            }
        }
    }

    /// A directory handle came back from its open: check mount and cycle
    /// policy, then start reading.
    fn dir_opened(&mut self, id: SlotId, dir: DirStream) {
        let stat = match fstat_fd(dir.fd()) {
            Ok(stat) => stat,
            Err(errno) => {
                drop(dir);
                self.open_fds -= 1;
                let record = self.records.get_mut(id);
                record.fail = Some(errno);
                record.state = DirState::Done;
                return;
            }
        };
        let record = self.records.get_mut(id);
        record.dev = stat.dev;
        record.ino = stat.ino;

        if self.opts.xdev && record.depth > 0 && stat.dev != record.root_dev {
            // Mount point: the entry was already offered, just don't read it.
            drop(dir);
            self.open_fds -= 1;
            self.records.get_mut(id).state = DirState::Done;
            return;
        }
        if self.opts.follow == Follow::Always && self.on_ancestor_path(id, stat.dev, stat.ino) {
            drop(dir);
            self.open_fds -= 1;
            let record = self.records.get_mut(id);
            record.fail = Some(libc::ELOOP);
            record.state = DirState::Done;
            return;
        }

        let record = self.records.get_mut(id);
        record.fd = Some(dir.fd());
        record.state = DirState::Reading;
        record.pending_op = true;
        let cookie = self.cookie(Op::Read, id);
        self.queue
            .push(cookie, Request::ReadDir { dir })
            .unwrap_or_else(|_| unreachable!("read pushed past freed slot"));
    }

    /// Is `(dev, ino)` already one of the directories on the chain above
    /// `id`? Ancestor records stay alive while descendants are pending, so
    /// the chain is complete.
    fn on_ancestor_path(&self, id: SlotId, dev: u64, ino: u64) -> bool {
        let mut cur = self.records.get(id).parent;
        while let Some(ancestor) = cur {
            let record = self.records.get(ancestor);
            if record.dev == dev && record.ino == ino {
                return true;
            }
            cur = record.parent;
        }
        false
    }

    /// Retire records whose processing, I/O, and children are all finished,
    /// emitting post-order visits on the way up.
    fn maybe_retire(&mut self, id: SlotId) {
        let mut cur = Some(id);
        while let Some(id) = cur {
            let record = self.records.get(id);
            if !record.processed || record.pending_op || record.children > 0 {
                return;
            }
            if self.opts.post_order && !self.stopping {
                let record = self.records.get(id);
                let mut post = WalkEntry::new(
                    record.path.clone(),
                    record.depth,
                    FileKind::Directory,
                    Visit::Post,
                    None,
                    record.path.clone().into_os_string(),
                    Some(record.root_dev),
                    record.root_len,
                    (self.opts.follow != Follow::Never && record.depth == 0)
                        || self.opts.follow == Follow::Always,
                );
                self.offer(&mut post);
            }
            trace!(target: "search", "retiring {:?}", self.records.get(id).path);
            let parent = self.records.get(id).parent;
            self.records.free(id);
            if let Some(parent) = parent {
                self.records.get_mut(parent).children -= 1;
            }
            cur = parent;
        }
    }

    fn offer(&mut self, entry: &mut WalkEntry) -> WalkAction {
        if entry.depth() < self.visit_min || entry.depth() > self.visit_max {
            return WalkAction::Continue;
        }
        let action = (self.consumer)(entry);
        if action == WalkAction::Stop {
            self.stopping = true;
        }
        action
    }

    fn cookie(&mut self, op: Op, id: SlotId) -> u64 {
        let cookie = self.next_cookie;
        self.next_cookie += 1;
        self.cookies.insert(cookie, (op, id));
        cookie
    }

    /// Wait out all in-flight I/O; dropped payloads close their handles.
    fn drain(&mut self) {
        self.queue.submit();
        while let Some(response) = self.queue.pop(true) {
            self.cookies.remove(&response.cookie);
        }
    }
}

fn fstat_fd(fd: RawFd) -> Result<Stat, i32> {
    let mut st = MaybeUninit::<libc::stat>::uninit();
    let ret = unsafe { libc::fstat(fd, st.as_mut_ptr()) };
    if ret != 0 {
        return Err(io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO));
    }
    Ok(Stat::from(unsafe { st.assume_init() }))
}
