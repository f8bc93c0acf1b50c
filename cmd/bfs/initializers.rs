use bfs_expr::{Cmdline, DebugFlags};
use tracing_subscriber::{
    EnvFilter, Registry, filter::LevelFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt,
};

/// Wire the `-D` channels into tracing targets, on top of whatever
/// `RUST_LOG` asks for.
pub fn init_tracing(debug: &DebugFlags) {
    let mut filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();
    let channels = [
        (debug.opt, "opt=debug"),
        (debug.search, "search=trace"),
        (debug.exec, "exec=debug"),
        (debug.stat, "ioq=trace"),
        (debug.rates, "rates=debug"),
    ];
    for (enabled, directive) in channels {
        if enabled {
            filter = filter.add_directive(directive.parse().expect("static directive parses"));
        }
    }
    let fmt_layer = fmt::layer().with_writer(std::io::stderr);
    Registry::default().with(filter).with(fmt_layer).init();
}

/// Pick worker counts and fd budgets from what the machine offers.
pub fn apply_resource_limits(cmdline: &mut Cmdline) {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    cmdline.walk.threads = cores.min(8).saturating_sub(1).max(1);

    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    let soft = if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } == 0 {
        limit.rlim_cur as usize
    } else {
        1024
    };
    let reserved = cmdline.arena.get(cmdline.root);
    let claimed = (reserved.persistent_fds + reserved.ephemeral_fds) as usize;
    // Leave headroom for stdio, the queue, and anything the expression
    // keeps open.
    cmdline.walk.nopenfd = soft.saturating_sub(16 + claimed).max(1);
}
