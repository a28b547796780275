/* Copyright (c) 2018 University of Utah
 *
 * Permission to use, copy, modify, and distribute this software for any
 * purpose with or without fee is hereby granted, provided that the above
 * copyright notice and this permission notice appear in all copies.
 *
 * THE SOFTWARE IS PROVIDED "AS IS" AND THE AUTHOR(S) DISCLAIM ALL WARRANTIES
 * WITH REGARD TO THIS SOFTWARE INCLUDING ALL IMPLIED WARRANTIES OF
 * MERCHANTABILITY AND FITNESS. IN NO EVENT SHALL AUTHORS BE LIABLE FOR
 * ANY SPECIAL, DIRECT, INDIRECT, OR CONSEQUENTIAL DAMAGES OR ANY DAMAGES
 * WHATSOEVER RESULTING FROM LOSS OF USE, DATA OR PROFITS, WHETHER IN AN
 * ACTION OF CONTRACT, NEGLIGENCE OR OTHER TORTIOUS ACTION, ARISING OUT OF
 * OR IN CONNECTION WITH THE USE OR PERFORMANCE OF THIS SOFTWARE.
 */

//! Windows completion-port backend. True IOCP is a completion API, not a
//! readiness one, so to present the same `Backend` contract as
//! epoll/kqueue/io_uring we drive each socket with a standing zero-byte
//! `WSARecv`/`WSASend` (the AFD-polling trick `mio` uses for its Windows
//! readiness layer): a zero-byte overlapped op completes as soon as the
//! socket actually has data to read or room to write, without consuming
//! anything, and is immediately reissued. The completion key handed to
//! `CreateIoCompletionPort` is the task id, so `GetQueuedCompletionStatusEx`
//! hands that id straight back without a registry lookup.

use std::collections::HashMap;
use std::ptr;
use std::sync::Mutex;

use windows_sys::Win32::Foundation::{CloseHandle, ERROR_IO_PENDING, HANDLE, WAIT_TIMEOUT};
use windows_sys::Win32::Networking::WinSock::{WSAGetLastError, WSARecv, WSASend, SOCKET, WSABUF};
use windows_sys::Win32::System::IO::{
    CreateIoCompletionPort, GetQueuedCompletionStatusEx, OVERLAPPED, OVERLAPPED_ENTRY,
    PostQueuedCompletionStatus,
};

use runtime_support::error::{Error, Result};

use crate::iotask::RawSocket;

use super::{Backend, Notification};

const WAKEUP_KEY: usize = usize::MAX;

/// A standing zero-byte `WSARecv`/`WSASend` op. `overlapped` must stay at
/// offset zero: completion only hands back a bare `*mut OVERLAPPED`, and we
/// recover the rest of this struct with a cast rather than a lookup.
#[repr(C)]
pub struct RawOverlapped {
    overlapped: OVERLAPPED,
    task_id: u64,
    write: bool,
}

impl Default for RawOverlapped {
    fn default() -> RawOverlapped {
        RawOverlapped {
            overlapped: unsafe { std::mem::zeroed() },
            task_id: 0,
            write: false,
        }
    }
}

struct PerSocket {
    socket: RawSocket,
    read_op: Box<RawOverlapped>,
    write_op: Box<RawOverlapped>,
}

fn issue_poll(socket: RawSocket, op: &mut RawOverlapped) -> Result<()> {
    op.overlapped = unsafe { std::mem::zeroed() };
    let mut buf = WSABUF {
        len: 0,
        buf: ptr::null_mut(),
    };
    let mut flags: u32 = 0;
    let rc = if op.write {
        unsafe {
            WSASend(
                socket as SOCKET,
                &buf,
                1,
                ptr::null_mut(),
                0,
                &mut op.overlapped,
                None,
            )
        }
    } else {
        unsafe {
            WSARecv(
                socket as SOCKET,
                &mut buf,
                1,
                ptr::null_mut(),
                &mut flags,
                &mut op.overlapped,
                None,
            )
        }
    };
    if rc == 0 {
        // Completed synchronously; IOCP still posts a completion packet
        // for overlapped handles associated with a port, so there's
        // nothing more to do here.
        return Ok(());
    }
    let err = unsafe { WSAGetLastError() };
    if err as u32 == ERROR_IO_PENDING {
        Ok(())
    } else {
        Err(Error::Fatal(std::io::Error::from_raw_os_error(err)))
    }
}

pub struct IocpBackend {
    port: HANDLE,
    registered: Mutex<HashMap<u64, PerSocket>>,
}

unsafe impl Send for IocpBackend {}
unsafe impl Sync for IocpBackend {}

impl Backend for IocpBackend {
    fn create() -> Result<IocpBackend> {
        let port = unsafe { CreateIoCompletionPort(-1isize as HANDLE, 0 as HANDLE, 0, 0) };
        if port == 0 as HANDLE {
            return Err(Error::Fatal(std::io::Error::last_os_error()));
        }
        Ok(IocpBackend {
            port,
            registered: Mutex::new(HashMap::new()),
        })
    }

    fn register_socket(&self, task_id: u64, socket: RawSocket) -> Result<()> {
        let handle = socket as HANDLE;
        let result = unsafe { CreateIoCompletionPort(handle, self.port, task_id as usize, 0) };
        if result == 0 as HANDLE {
            return Err(Error::Fatal(std::io::Error::last_os_error()));
        }

        let mut read_op = Box::new(RawOverlapped {
            task_id,
            write: false,
            ..Default::default()
        });
        let mut write_op = Box::new(RawOverlapped {
            task_id,
            write: true,
            ..Default::default()
        });
        issue_poll(socket, &mut read_op)?;
        issue_poll(socket, &mut write_op)?;

        self.registered.lock().unwrap().insert(
            task_id,
            PerSocket {
                socket,
                read_op,
                write_op,
            },
        );
        Ok(())
    }

    fn deregister_socket(&self, socket: RawSocket) -> Result<()> {
        self.registered.lock().unwrap().retain(|_, s| s.socket != socket);
        Ok(())
    }

    fn wait(&self, timeout_ms: Option<u64>) -> Result<Vec<Notification>> {
        let mut entries: [OVERLAPPED_ENTRY; 256] = unsafe { std::mem::zeroed() };
        let mut removed: u32 = 0;
        let timeout = timeout_ms.map(|ms| ms as u32).unwrap_or(u32::MAX);

        let ok = unsafe {
            GetQueuedCompletionStatusEx(
                self.port,
                entries.as_mut_ptr(),
                entries.len() as u32,
                &mut removed,
                timeout,
                0,
            )
        };
        if ok == 0 {
            let err = unsafe { windows_sys::Win32::Foundation::GetLastError() };
            if err == WAIT_TIMEOUT {
                return Ok(Vec::new());
            }
            return Err(Error::Fatal(std::io::Error::from_raw_os_error(err as i32)));
        }

        let mut out = Vec::with_capacity(removed as usize);
        let mut registered = self.registered.lock().unwrap();
        for entry in &entries[..removed as usize] {
            if entry.lpCompletionKey == WAKEUP_KEY {
                continue;
            }
            if entry.lpOverlapped.is_null() {
                continue;
            }
            let raw = entry.lpOverlapped as *mut RawOverlapped;
            let task_id = unsafe { (*raw).task_id };
            let write = unsafe { (*raw).write };

            let Some(state) = registered.get_mut(&task_id) else {
                continue;
            };
            out.push(Notification {
                task_id,
                readable: !write,
                writable: write,
                error: false,
            });
            let op = if write {
                &mut state.write_op
            } else {
                &mut state.read_op
            };
            let socket = state.socket;
            let _ = issue_poll(socket, op);
        }
        Ok(out)
    }

    fn interrupt_wait(&self) -> Result<()> {
        let ok = unsafe { PostQueuedCompletionStatus(self.port, 0, WAKEUP_KEY, ptr::null_mut()) };
        if ok == 0 {
            return Err(Error::Fatal(std::io::Error::last_os_error()));
        }
        Ok(())
    }
}

impl Drop for IocpBackend {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.port);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_interrupt_round_trip() {
        let backend = IocpBackend::create().expect("iocp create");
        backend.interrupt_wait().expect("interrupt");
        let notifications = backend.wait(Some(100)).expect("wait");
        assert!(notifications.is_empty());
    }
}
