use std::time::Duration;

use crate::{InjectError, ProcessHandle, ProcessId, Protection, ThreadId, Va};

/// Access to processes and threads of the host.
pub trait ProcessHost {
    /// Opens a reference to the process with the given identifier.
    fn open_process(&self, pid: ProcessId) -> Result<ProcessHandle, InjectError>;

    /// Releases a reference obtained from [`open_process`].
    ///
    /// [`open_process`]: Self::open_process
    fn close_process(&self, process: ProcessHandle);

    /// Checks whether the process runs under the 32-bit translation
    /// subsystem of a 64-bit host.
    fn is_translated(&self, process: ProcessHandle) -> bool;

    /// Returns the thread on which the current notification is delivered.
    fn current_thread(&self) -> ThreadId;
}

/// Registration of the two notification callbacks.
///
/// The host routes every process creation/exit event to
/// `Engine::process_notify` and every image load event to
/// `Engine::image_notify` while the corresponding registration is active.
pub trait NotifyRegistration {
    /// Starts delivering process creation and exit notifications.
    fn register_process_notify(&self) -> Result<(), InjectError>;

    /// Stops delivering process creation and exit notifications.
    fn unregister_process_notify(&self);

    /// Starts delivering image load notifications.
    fn register_image_notify(&self) -> Result<(), InjectError>;

    /// Stops delivering image load notifications.
    fn unregister_image_notify(&self);
}

/// Virtual memory operations qualified by a process handle.
pub trait VirtualMemory {
    /// Size of a page in the target address space.
    fn page_size(&self) -> usize {
        0x1000
    }

    /// Commits `size` bytes with the given protection and returns the base.
    fn allocate(
        &self,
        process: ProcessHandle,
        size: usize,
        protection: Protection,
    ) -> Result<Va, InjectError>;

    /// Changes the protection of a committed region and returns the
    /// previous protection.
    fn protect(
        &self,
        process: ProcessHandle,
        address: Va,
        size: usize,
        protection: Protection,
    ) -> Result<Protection, InjectError>;

    /// Releases a region returned by [`allocate`].
    ///
    /// [`allocate`]: Self::allocate
    fn free(&self, process: ProcessHandle, address: Va) -> Result<(), InjectError>;

    /// Reads memory of the target process.
    fn read(&self, process: ProcessHandle, address: Va, buffer: &mut [u8])
    -> Result<(), InjectError>;

    /// Writes memory of the target process.
    fn write(&self, process: ProcessHandle, address: Va, data: &[u8]) -> Result<(), InjectError>;
}

/// Identifies the image a loader should map.
#[derive(Debug, Clone, Copy)]
pub enum ImageSource<'a> {
    /// An image already present at the given base in the target.
    Base(Va),

    /// An image file on disk.
    Path(&'a str),

    /// An in-memory image, encrypted with `key` when one is present.
    Payload {
        /// The image bytes.
        data: &'a [u8],

        /// Key the payload was sealed with.
        key: Option<[u32; 4]>,
    },
}

/// An image mapped into a target process by the [`ImageLoader`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedImage {
    /// Base address of the image.
    pub base: Va,

    /// Entry point, or zero if the image has none.
    pub entry_point: Va,

    /// Size of the mapped image.
    pub size: u64,

    /// Name reported by the loader.
    pub name: String,
}

/// The image loading collaborator.
pub trait ImageLoader {
    /// Finds the image in the target, or maps it there.
    fn find_or_map_image(
        &self,
        process: ProcessHandle,
        source: ImageSource<'_>,
    ) -> Result<MappedImage, InjectError>;

    /// Calls `visit` for each TLS initializer of the image, in table order.
    ///
    /// An error returned by `visit` stops the enumeration and is propagated.
    fn for_each_tls_initializer(
        &self,
        process: ProcessHandle,
        image: &MappedImage,
        visit: &mut dyn FnMut(Va) -> Result<(), InjectError>,
    ) -> Result<(), InjectError>;

    /// Releases host-side memory associated with a mapped image.
    fn free_image_memory(&self, image: &MappedImage);
}

/// Identifier of one delivery request.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct TicketId(pub u64);

/// The flavor of an asynchronous callback descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApcKind {
    /// Runs `routine(context)` in user mode of the target thread.
    User,

    /// Kernel-mode carrier that re-queues a [`ApcKind::User`] descriptor
    /// on the target thread once it runs there.
    Force,
}

/// A callback descriptor handed to the [`ApcPrimitive`].
///
/// Ownership passes to the primitive on insertion. When the target thread
/// reaches its delivery point the host must pass the descriptor back to the
/// engine's kernel routine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApcDescriptor {
    /// Request this descriptor belongs to.
    pub ticket: TicketId,

    /// Thread the callback is bound to.
    pub thread: ThreadId,

    /// Descriptor flavor.
    pub kind: ApcKind,

    /// Code to run in the target.
    pub routine: Va,

    /// Argument passed to `routine`.
    pub context: Va,

    /// Whether the target runs under the translation subsystem.
    pub translated: bool,
}

/// The low-level asynchronous callback primitive of the host.
pub trait ApcPrimitive {
    /// Queues the descriptor on its thread.
    ///
    /// A refused descriptor is handed back so the caller can release it.
    fn insert(&self, descriptor: ApcDescriptor) -> Result<(), ApcDescriptor>;

    /// Checks whether the thread is terminating.
    fn is_thread_terminating(&self, thread: ThreadId) -> bool;

    /// Redirects a user callback through the translation subsystem's
    /// dispatcher.
    fn wrap_translated(&self, routine: &mut Va, context: &mut Va);

    /// Parks the current thread in an alertable wait.
    fn alertable_delay(&self, delay: Duration);
}

/// Everything the engine needs from its host.
pub trait InjectionHost:
    ProcessHost + NotifyRegistration + VirtualMemory + ImageLoader + ApcPrimitive
{
}

impl<T> InjectionHost for T where
    T: ProcessHost + NotifyRegistration + VirtualMemory + ImageLoader + ApcPrimitive
{
}
