//! Asynchronous filesystem I/O.
//!
//! An [`IoQueue`] owns a bounded request ring and response ring serviced by a
//! small pool of worker threads, hiding syscall latency from the traversal
//! scheduler. Pushes stay invisible to workers until [`IoQueue::submit`]
//! publishes them in a batch, which keeps the semaphore traffic proportional
//! to batches rather than requests. Completions come back in arbitrary order
//! and are correlated through an opaque cookie.

mod ring;

use std::ffi::{CStr, CString, OsStr};
use std::io;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use bfs_common::{Dirent, FileKind, Stat, stat_at};
use ring::Ring;
use tracing::trace;

/// Directory entries returned per `ReadDir` request.
const READDIR_BATCH: usize = 1024;

/// An open directory stream, movable between threads.
///
/// The underlying `DIR` is only ever touched by one thread at a time: the
/// stream travels inside requests and responses, and ownership transfers with
/// the message.
#[derive(Debug)]
pub struct DirStream {
    dir: NonNull<libc::DIR>,
    fd: RawFd,
}

unsafe impl Send for DirStream {}

impl DirStream {
    /// `openat` + `fdopendir` relative to `dirfd` (or the cwd).
    pub fn open_at(dirfd: Option<RawFd>, path: &CStr) -> io::Result<Self> {
        let flags = libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC;
        let fd = unsafe { libc::openat(dirfd.unwrap_or(libc::AT_FDCWD), path.as_ptr(), flags) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        match NonNull::new(unsafe { libc::fdopendir(fd) }) {
            Some(dir) => Ok(Self { dir, fd }),
            None => {
                let err = io::Error::last_os_error();
                unsafe { libc::close(fd) };
                Err(err)
            }
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Read up to `max` entries; the flag reports end of stream.
    pub fn read_batch(&mut self, max: usize) -> io::Result<(Vec<Dirent>, bool)> {
        let mut entries = Vec::new();
        while entries.len() < max {
            // readdir reports errors only through errno.
            unsafe { *libc::__errno_location() = 0 };
            let entry = unsafe { libc::readdir64(self.dir.as_ptr()) };
            if entry.is_null() {
                let errno = io::Error::last_os_error();
                if errno.raw_os_error() == Some(0) {
                    return Ok((entries, true));
                }
                return Err(errno);
            }
            let entry = unsafe { &*entry };
            let name = unsafe { CStr::from_ptr(entry.d_name.as_ptr()) };
            entries.push(Dirent {
                name: OsStr::from_bytes(name.to_bytes()).to_os_string(),
                kind: FileKind::from_d_type(entry.d_type),
                ino: entry.d_ino,
            });
        }
        Ok((entries, false))
    }
}

impl Drop for DirStream {
    fn drop(&mut self) {
        // closedir releases the fd as well.
        unsafe { libc::closedir(self.dir.as_ptr()) };
    }
}

/// A filesystem operation to run on a worker.
#[derive(Debug)]
pub enum Request {
    OpenDir {
        dirfd: Option<RawFd>,
        path: CString,
    },
    ReadDir {
        dir: DirStream,
    },
    CloseDir {
        dir: DirStream,
    },
    Stat {
        dirfd: Option<RawFd>,
        path: CString,
        follow: bool,
    },
    /// Completes without any syscall; for exercising the queue itself.
    NopLight,
    /// Performs one known-cheap syscall to model a real operation.
    NopHeavy,
}

/// Operation-specific completion payload.
#[derive(Debug)]
pub enum Payload {
    Dir(DirStream),
    Entries {
        dir: DirStream,
        entries: Vec<Dirent>,
        done: bool,
    },
    Closed,
    Stat(Stat),
    Nop,
}

/// One completion, correlated by the cookie given at push time.
#[derive(Debug)]
pub struct Response {
    pub cookie: u64,
    pub payload: io::Result<Payload>,
}

/// A push that found the queue at capacity; the request comes back.
#[derive(Debug)]
pub struct Full(pub u64, pub Request);

struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    fn new() -> Self {
        Self {
            count: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    fn post(&self, n: usize) {
        if n == 0 {
            return;
        }
        let mut count = self.count.lock().unwrap();
        *count += n;
        if n == 1 {
            self.cond.notify_one();
        } else {
            self.cond.notify_all();
        }
    }

    fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.cond.wait(count).unwrap();
        }
        *count -= 1;
    }

    fn try_wait(&self) -> bool {
        let mut count = self.count.lock().unwrap();
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }
}

struct Shared {
    requests: Ring<(u64, Request)>,
    responses: Ring<Response>,
    /// One unit per published request; workers park here.
    work: Semaphore,
    /// One unit per completed response; the owner parks here.
    done: Semaphore,
    shutdown: AtomicBool,
}

/// Bounded multi-producer/multi-consumer queue of filesystem operations.
///
/// The handle itself is owned by one thread: that thread pushes requests,
/// publishes them with `submit`, and drains responses with `pop`. With zero
/// workers, `pop` services requests synchronously instead.
pub struct IoQueue {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    depth: usize,
    /// Requests pushed, response not yet popped.
    in_flight: usize,
    /// Requests pushed since the last submit.
    unpublished: usize,
}

impl IoQueue {
    /// Allocate rings of capacity `depth` and spawn `threads` workers.
    pub fn new(depth: usize, threads: usize) -> Self {
        let shared = Arc::new(Shared {
            requests: Ring::new(depth),
            responses: Ring::new(depth),
            work: Semaphore::new(),
            done: Semaphore::new(),
            shutdown: AtomicBool::new(false),
        });
        let workers = (0..threads)
            .map(|i| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("bfs-ioq-{i}"))
                    .spawn(move || worker(shared))
                    .expect("failed to spawn I/O worker")
            })
            .collect();
        Self {
            shared,
            workers,
            depth,
            in_flight: 0,
            unpublished: 0,
        }
    }

    /// Free request slots remaining.
    pub fn capacity(&self) -> usize {
        self.depth - self.in_flight
    }

    /// Enqueue a request. Not visible to workers until [`IoQueue::submit`].
    pub fn push(&mut self, cookie: u64, request: Request) -> Result<(), Full> {
        if self.in_flight == self.depth {
            return Err(Full(cookie, request));
        }
        self.shared
            .requests
            .push((cookie, request))
            .unwrap_or_else(|_| unreachable!("request ring full below queue depth"));
        self.in_flight += 1;
        self.unpublished += 1;
        Ok(())
    }

    /// Publish every push since the last submit.
    pub fn submit(&mut self) {
        if !self.workers.is_empty() {
            self.shared.work.post(self.unpublished);
        }
        self.unpublished = 0;
    }

    /// Remove one completion. Blocking waits until a response arrives, or
    /// returns `None` immediately when nothing is outstanding.
    pub fn pop(&mut self, blocking: bool) -> Option<Response> {
        if self.in_flight == 0 {
            return None;
        }
        if self.workers.is_empty() {
            // Synchronous mode: the owner services the request inline.
            let (cookie, request) = self.shared.requests.pop()?;
            self.in_flight -= 1;
            self.unpublished = self.unpublished.saturating_sub(1);
            return Some(Response {
                cookie,
                payload: service(request),
            });
        }
        if blocking {
            // Anything unpublished would never complete; flush it.
            self.submit();
            self.shared.done.wait();
        } else if !self.shared.done.try_wait() {
            return None;
        }
        let response = self
            .shared
            .responses
            .pop()
            .unwrap_or_else(|| unreachable!("done semaphore posted without a response"));
        self.in_flight -= 1;
        Some(response)
    }
}

impl Drop for IoQueue {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.work.post(self.workers.len().max(1));
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        // Whatever is left in the rings is dropped with them.
    }
}

fn worker(shared: Arc<Shared>) {
    trace!(target: "ioq", "worker {:?} up", std::thread::current().name());
    loop {
        shared.work.wait();
        match shared.requests.pop() {
            Some((cookie, request)) => {
                let payload = service(request);
                let mut response = Response { cookie, payload };
                // A slot is guaranteed free since completions never outnumber
                // requests in flight, but the CAS can race transiently.
                while let Err(r) = shared.responses.push(response) {
                    response = r;
                    std::thread::yield_now();
                }
                shared.done.post(1);
            }
            None => {
                if shared.shutdown.load(Ordering::Acquire) {
                    // Pass the wakeup along so every sibling exits too.
                    shared.work.post(1);
                    break;
                }
            }
        }
    }
    trace!(target: "ioq", "worker {:?} down", std::thread::current().name());
}

fn service(request: Request) -> io::Result<Payload> {
    match request {
        Request::OpenDir { dirfd, path } => DirStream::open_at(dirfd, &path).map(Payload::Dir),
        Request::ReadDir { mut dir } => dir
            .read_batch(READDIR_BATCH)
            .map(|(entries, done)| Payload::Entries { dir, entries, done }),
        Request::CloseDir { dir } => {
            drop(dir);
            Ok(Payload::Closed)
        }
        Request::Stat {
            dirfd,
            path,
            follow,
        } => stat_at(dirfd, &path, follow).map(Payload::Stat),
        Request::NopLight => Ok(Payload::Nop),
        Request::NopHeavy => {
            unsafe { libc::getpid() };
            Ok(Payload::Nop)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bfs_common::to_cstring;
    use std::collections::BTreeMap;
    use std::fs;

    fn cookie_counts(cookies: &[u64]) -> BTreeMap<u64, usize> {
        let mut counts = BTreeMap::new();
        for &c in cookies {
            *counts.entry(c).or_insert(0) += 1;
        }
        counts
    }

    #[test]
    fn conserves_cookies_across_threads() {
        let mut queue = IoQueue::new(8, 3);
        let mut pushed = Vec::new();
        let mut popped = Vec::new();
        for cookie in 0..200u64 {
            let mut request = Request::NopLight;
            loop {
                match queue.push(cookie, request) {
                    Ok(()) => break,
                    Err(Full(_, r)) => {
                        request = r;
                        queue.submit();
                        popped.push(queue.pop(true).unwrap().cookie);
                    }
                }
            }
            pushed.push(cookie);
            queue.submit();
        }
        while let Some(response) = queue.pop(true) {
            popped.push(response.cookie);
        }
        assert_eq!(cookie_counts(&pushed), cookie_counts(&popped));
    }

    #[test]
    fn capacity_tracks_in_flight_requests() {
        let mut queue = IoQueue::new(2, 2);
        assert_eq!(queue.capacity(), 2);
        queue.push(1, Request::NopLight).unwrap();
        queue.push(2, Request::NopLight).unwrap();
        assert_eq!(queue.capacity(), 0);
        let Err(Full(3, third)) = queue.push(3, Request::NopLight) else {
            panic!("push should report a full queue");
        };
        queue.submit();
        assert!(queue.pop(true).is_some());
        queue.push(3, third).unwrap();
        queue.submit();
        assert!(queue.pop(true).is_some());
        assert!(queue.pop(true).is_some());
        assert_eq!(queue.capacity(), 2);
        assert!(queue.pop(true).is_none());
    }

    #[test]
    fn zero_threads_services_synchronously() {
        let mut queue = IoQueue::new(4, 0);
        queue.push(7, Request::NopHeavy).unwrap();
        queue.push(8, Request::NopLight).unwrap();
        queue.submit();
        let first = queue.pop(true).unwrap();
        assert_eq!(first.cookie, 7);
        let second = queue.pop(false).unwrap();
        assert_eq!(second.cookie, 8);
        assert!(queue.pop(true).is_none());
    }

    #[test]
    fn nonblocking_pop_returns_nothing_until_published() {
        let mut queue = IoQueue::new(4, 1);
        queue.push(1, Request::NopLight).unwrap();
        // Not submitted yet: a worker must not see it.
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(queue.pop(false).is_none());
        queue.submit();
        assert_eq!(queue.pop(true).unwrap().cookie, 1);
    }

    #[test]
    fn walks_a_real_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a"), b"1").unwrap();
        fs::write(dir.path().join("b"), b"2").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();

        let mut queue = IoQueue::new(4, 2);
        let path = to_cstring(dir.path().as_os_str()).unwrap();
        queue.push(1, Request::OpenDir { dirfd: None, path }).unwrap();
        queue.submit();
        let response = queue.pop(true).unwrap();
        let Payload::Dir(stream) = response.payload.unwrap() else {
            panic!("open returned the wrong payload");
        };

        queue.push(2, Request::ReadDir { dir: stream }).unwrap();
        queue.submit();
        let response = queue.pop(true).unwrap();
        let Payload::Entries { dir, entries, done } = response.payload.unwrap() else {
            panic!("read returned the wrong payload");
        };
        assert!(done);
        let mut names: Vec<_> = entries
            .iter()
            .map(|e| e.name.to_string_lossy().into_owned())
            .filter(|n| n != "." && n != "..")
            .collect();
        names.sort();
        assert_eq!(names, ["a", "b", "sub"]);

        queue.push(3, Request::CloseDir { dir }).unwrap();
        queue.submit();
        let response = queue.pop(true).unwrap();
        assert!(matches!(response.payload, Ok(Payload::Closed)));
    }

    #[test]
    fn stat_request_reports_errors_in_band() {
        let mut queue = IoQueue::new(2, 1);
        let path = to_cstring(std::ffi::OsStr::new("/definitely/not/here")).unwrap();
        queue
            .push(9, Request::Stat { dirfd: None, path, follow: true })
            .unwrap();
        queue.submit();
        let response = queue.pop(true).unwrap();
        assert_eq!(response.cookie, 9);
        let err = response.payload.unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    }
}
