// Foreground/resume notifications

use anyhow::Result;
use futures::stream::{BoxStream, StreamExt};

/// SIGCONT for the targets whose numbering is known; `None` elsewhere
#[cfg(unix)]
pub(crate) fn sigcont() -> Option<i32> {
    if cfg!(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd",
        target_os = "dragonfly"
    )) {
        Some(19)
    } else if cfg!(any(target_os = "solaris", target_os = "illumos")) {
        Some(25)
    } else if cfg!(all(
        any(target_os = "linux", target_os = "android"),
        any(
            target_arch = "mips",
            target_arch = "mips64",
            target_arch = "mips32r6",
            target_arch = "mips64r6"
        )
    )) {
        Some(25)
    } else if cfg!(all(
        any(target_os = "linux", target_os = "android"),
        any(
            target_arch = "x86",
            target_arch = "x86_64",
            target_arch = "arm",
            target_arch = "aarch64",
            target_arch = "riscv32",
            target_arch = "riscv64",
            target_arch = "powerpc",
            target_arch = "powerpc64",
            target_arch = "s390x",
            target_arch = "loongarch64"
        )
    )) {
        Some(18)
    } else {
        None
    }
}

/// Stream that yields once every time the process is resumed
///
/// On unix this is SIGCONT, delivered when a stopped process (Ctrl+Z,
/// `kill -STOP`, laptop suspend of a job) continues. On other targets, and
/// on unix targets with an unrecognised SIGCONT number, the stream never yields.
#[cfg(unix)]
pub fn foreground_events() -> Result<BoxStream<'static, ()>> {
    use anyhow::Context;
    use tokio::signal::unix::{signal, SignalKind};

    let Some(signum) = sigcont() else {
        tracing::warn!("SIGCONT number unknown on this target, resume events disabled");
        return Ok(futures::stream::pending().boxed());
    };

    let resumed =
        signal(SignalKind::from_raw(signum)).context("Failed to install SIGCONT handler")?;

    Ok(futures::stream::unfold(resumed, |mut sig| async move {
        sig.recv().await.map(|_| ((), sig))
    })
    .boxed())
}

#[cfg(not(unix))]
pub fn foreground_events() -> Result<BoxStream<'static, ()>> {
    Ok(futures::stream::pending().boxed())
}
