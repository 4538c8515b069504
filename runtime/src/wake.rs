//! Bridges blocking work (DNS-over-HTTPS requests, `getaddrinfo` lookups) back
//! into the single-threaded poll loop.
//!
//! The reactor in the crate root only ever multiplexes socket readiness, and
//! everything it drives must run on the loop thread. `spawn_blocking` runs a
//! closure on a dedicated thread and rings a loopback UDP doorbell when it is
//! done, so the result can be delivered through the same `Io` machinery used
//! for ordinary sockets instead of a second, parallel wakeup mechanism.

use std::cell::RefCell;
use std::net::UdpSocket;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::thread;

use log::error;
use stakker::{Fwd, Ret};

use crate::Io;

/// Runs `f` on a new thread and delivers its return value to `ret` once the
/// loop next polls. If the doorbell socket can't be set up, `ret` is dropped
/// without firing, identically to the actor holding it no longer existing.
pub fn spawn_blocking<T, F>(f: F, ret: Ret<T>)
where
	T: Send + 'static,
	F: FnOnce() -> T + Send + 'static,
{
	let doorbell = match UdpSocket::bind("127.0.0.1:0") {
		Ok(socket) => socket,
		Err(err) => {
			error!("Failed to bind wakeup socket: {err}");
			return;
		}
	};

	if let Err(err) = doorbell.set_nonblocking(true) {
		error!("Failed to set wakeup socket to non-blocking: {err}");
		return;
	}

	let addr = match doorbell.local_addr() {
		Ok(addr) => addr,
		Err(err) => {
			error!("Failed to read wakeup socket address: {err}");
			return;
		}
	};

	let slot: Arc<Mutex<Option<T>>> = Arc::new(Mutex::new(None));
	let slot_thread = slot.clone();

	thread::spawn(move || {
		let value = f();
		*slot_thread.lock().expect("wakeup slot mutex is never poisoned") = Some(value);

		match UdpSocket::bind("127.0.0.1:0") {
			Ok(ring) => {
				if let Err(err) = ring.send_to(&[0], addr) {
					error!("Failed to ring wakeup doorbell: {err}");
				}
			}
			Err(err) => error!("Failed to bind doorbell sender: {err}"),
		}
	});

	// Holds the `Io` alive until the doorbell rings, at which point the
	// callback drops it itself to deregister the socket from the reactor.
	let io: Rc<RefCell<Option<Io<UdpSocket>>>> = Rc::new(RefCell::new(None));
	let io_in_callback = io.clone();
	let ret = RefCell::new(Some(ret));

	let fwd = Fwd::new(move |_buf| {
		io_in_callback.borrow_mut().take();

		let Some(ret) = ret.borrow_mut().take() else { return };

		match slot.lock().expect("wakeup slot mutex is never poisoned").take() {
			Some(value) => ret.ret(value),
			None => error!("Wakeup doorbell rang with no result queued"),
		}
	});

	*io.borrow_mut() = Some(Io::new(doorbell, fwd));
}
