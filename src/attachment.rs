//! OS-level resources that travel alongside a message's bytes through a side channel. Each
//!  attachment is owned by exactly one party at a time and released when dropped.

use std::fmt::{Debug, Formatter};
use std::sync::Arc;
#[cfg(test)] use mockall::automock;
use tracing::trace;

#[cfg(unix)]
pub type FileHandle = std::os::fd::OwnedFd;
#[cfg(windows)]
pub type FileHandle = std::os::windows::io::OwnedHandle;


/// The globally unique name of a port in the port network that connects processes
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PortName {
    pub v1: u64,
    pub v2: u64,
}
impl Debug for PortName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016X}.{:016X}", self.v1, self.v2)
    }
}

/// The node-level owner of ports, notified when a port is released without being transferred
#[cfg_attr(test, automock)]
pub trait PortController: Send + Sync + 'static {
    fn close_port(&self, name: PortName);
}

/// An owned reference to a port. Dropping it closes the port through its controller, unless
///  ownership was given up through [ScopedPort::release].
pub struct ScopedPort {
    name: PortName,
    controller: Option<Arc<dyn PortController>>,
}
impl ScopedPort {
    pub fn new(name: PortName, controller: Arc<dyn PortController>) -> ScopedPort {
        ScopedPort {
            name,
            controller: Some(controller),
        }
    }

    pub fn name(&self) -> PortName {
        self.name
    }

    pub fn is_valid(&self) -> bool {
        self.controller.is_some()
    }

    /// gives up ownership without closing the port
    pub fn release(mut self) -> PortName {
        self.controller = None;
        self.name
    }
}
impl Drop for ScopedPort {
    fn drop(&mut self) {
        if let Some(controller) = self.controller.take() {
            trace!("closing port {:?}", self.name);
            controller.close_port(self.name);
        }
    }
}
impl Debug for ScopedPort {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ScopedPort({:?})", self.name)
    }
}


/// An owned Mach send right, deallocated when dropped
#[cfg(target_vendor = "apple")]
#[derive(Debug)]
pub struct MachSendRight(mach2::port::mach_port_t);

#[cfg(target_vendor = "apple")]
impl MachSendRight {
    /// Takes ownership of a send right
    ///
    /// # Safety
    /// `port` must be a send right that the caller owns and does not deallocate elsewhere
    pub unsafe fn from_raw(port: mach2::port::mach_port_t) -> MachSendRight {
        MachSendRight(port)
    }

    pub fn as_raw(&self) -> mach2::port::mach_port_t {
        self.0
    }

    pub fn into_raw(mut self) -> mach2::port::mach_port_t {
        std::mem::replace(&mut self.0, mach2::port::MACH_PORT_NULL)
    }
}

#[cfg(target_vendor = "apple")]
impl Drop for MachSendRight {
    fn drop(&mut self) {
        if self.0 != mach2::port::MACH_PORT_NULL {
            // SAFETY: we own this send right, and nobody else deallocates it
            unsafe {
                mach2::mach_port::mach_port_deallocate(mach2::traps::mach_task_self(), self.0);
            }
        }
    }
}


/// The side lists of a message. A slot becomes `None` once its attachment was consumed by a
///  reader, so indices written into the payload stay stable.
#[derive(Default)]
pub struct Attachments {
    pub(crate) handles: Vec<Option<FileHandle>>,
    pub(crate) ports: Vec<Option<ScopedPort>>,
    #[cfg(target_vendor = "apple")]
    pub(crate) send_rights: Vec<Option<MachSendRight>>,
}

impl Debug for Attachments {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        #[cfg(target_vendor = "apple")]
        return write!(f, "Attachments{{handles:{}, ports:{}, send_rights:{}}}", self.handles.len(), self.ports.len(), self.send_rights.len());
        #[cfg(not(target_vendor = "apple"))]
        return write!(f, "Attachments{{handles:{}, ports:{}}}", self.handles.len(), self.ports.len());
    }
}

impl Attachments {
    pub fn is_empty(&self) -> bool {
        #[cfg(target_vendor = "apple")]
        if !self.send_rights.is_empty() {
            return false;
        }
        self.handles.is_empty() && self.ports.is_empty()
    }

    /// Moves all remaining (i.e. unconsumed) file handles out, in the order they were written
    pub fn take_handles(&mut self) -> Vec<FileHandle> {
        std::mem::take(&mut self.handles).into_iter().flatten().collect()
    }

    pub fn take_ports(&mut self) -> Vec<ScopedPort> {
        std::mem::take(&mut self.ports).into_iter().flatten().collect()
    }

    #[cfg(target_vendor = "apple")]
    pub fn take_send_rights(&mut self) -> Vec<MachSendRight> {
        std::mem::take(&mut self.send_rights).into_iter().flatten().collect()
    }
}

/// Takes the first attachment that was not consumed yet
pub(crate) fn take_next<T>(slots: &mut [Option<T>]) -> Option<T> {
    slots.iter_mut()
        .find_map(|slot| slot.take())
}

#[cfg(test)]
mod tests {
    use mockall::predicate::eq;
    use super::*;

    fn name(n: u64) -> PortName {
        PortName { v1: n, v2: n + 1 }
    }

    #[test]
    fn test_drop_closes_port() {
        let mut controller = MockPortController::new();
        controller.expect_close_port()
            .with(eq(name(7)))
            .times(1)
            .return_const(());

        let port = ScopedPort::new(name(7), Arc::new(controller));
        assert!(port.is_valid());
        drop(port);
    }

    #[test]
    fn test_release_does_not_close() {
        let mut controller = MockPortController::new();
        controller.expect_close_port()
            .times(0);

        let port = ScopedPort::new(name(3), Arc::new(controller));
        assert_eq!(port.release(), name(3));
    }

    #[test]
    fn test_port_name_debug() {
        assert_eq!(format!("{:?}", PortName { v1: 0xab, v2: 1 }), "00000000000000AB.0000000000000001");
    }

    #[cfg(not(target_vendor = "apple"))]
    #[test]
    fn test_attachments_debug() {
        let mut attachments = Attachments::default();
        attachments.ports.push(None);
        assert_eq!(format!("{:?}", attachments), "Attachments{handles:0, ports:1}");
    }

    #[cfg(target_vendor = "apple")]
    #[test]
    fn test_attachments_debug() {
        let mut attachments = Attachments::default();
        attachments.ports.push(None);
        attachments.send_rights.push(None);
        assert_eq!(format!("{:?}", attachments), "Attachments{handles:0, ports:1, send_rights:1}");
    }

    #[test]
    fn test_take_next() {
        let mut slots = vec![None, Some(1), Some(2)];
        assert_eq!(take_next(&mut slots), Some(1));
        assert_eq!(take_next(&mut slots), Some(2));
        assert_eq!(take_next(&mut slots), None);
        assert_eq!(slots.len(), 3);
    }

    #[test]
    fn test_take_ports_skips_consumed() {
        let mut controller = MockPortController::new();
        controller.expect_close_port()
            .times(0);
        let controller = Arc::new(controller);

        let mut attachments = Attachments::default();
        attachments.ports.push(Some(ScopedPort::new(name(1), controller.clone())));
        attachments.ports.push(None);
        attachments.ports.push(Some(ScopedPort::new(name(5), controller.clone())));

        let ports = attachments.take_ports();
        assert!(attachments.is_empty());
        assert_eq!(ports.iter().map(|p| p.name()).collect::<Vec<_>>(), vec![name(1), name(5)]);

        for port in ports {
            port.release();
        }
    }
}
