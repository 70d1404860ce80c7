//! Signal installation and delivery through the trampoline. Lives in its
//! own binary because dispositions are process-wide.

use raya_os::signal::{self, Handler, Signal};
use raya_os::spawn::{spawn, SpawnRequest};
use std::time::Duration;

const CHILD_ENV: &str = "RAYA_OS_TERM_CHILD";

#[test]
fn test_install_is_idempotent_and_delivers() {
    signal::install(Signal::User1, Handler::Runtime);
    let once = signal::query(Signal::User1);
    signal::install(Signal::User1, Handler::Runtime);
    assert_eq!(signal::query(Signal::User1), once);
    assert_eq!(once.handler, Handler::Runtime);

    let before = signal::delivery_count(Signal::User1);
    unsafe { libc::raise(libc::SIGUSR1) };

    let pending = signal::wait_pending(Some(Duration::from_secs(1)));
    assert!(pending.contains(Signal::User1));
    assert_eq!(signal::delivery_count(Signal::User1), before + 1);
}

#[test]
fn test_query_has_no_side_effects() {
    let before = signal::query(Signal::User2);
    let again = signal::query(Signal::User2);
    assert_eq!(before.handler, again.handler);
    assert_eq!(signal::handler_of(Signal::User2), before.handler);
}

fn termination_child(mode: &str) -> Option<i32> {
    let exe = std::env::current_exe().unwrap();
    let req = SpawnRequest::new(exe)
        .arg("--exact")
        .arg("test_termination_exit_code")
        .arg("--nocapture")
        .env(CHILD_ENV, mode)
        .fd(0, 0)
        .fd(1, 1)
        .fd(2, 2);
    spawn(&req).unwrap().wait().unwrap().exit_status()
}

#[test]
fn test_termination_exit_code() {
    if let Ok(mode) = std::env::var(CHILD_ENV) {
        signal::install(Signal::Terminate, Handler::Runtime);
        unsafe {
            if mode == "queue" {
                let value = libc::sigval {
                    sival_ptr: 7usize as *mut libc::c_void,
                };
                libc::sigqueue(libc::getpid(), libc::SIGTERM, value);
            } else {
                libc::kill(libc::getpid(), libc::SIGTERM);
            }
        }
        std::thread::sleep(Duration::from_secs(5));
        unreachable!("termination signal did not end the process");
    }

    assert_eq!(termination_child("queue"), Some(7));
    assert_eq!(termination_child("kill"), Some(128 + libc::SIGTERM));
}
