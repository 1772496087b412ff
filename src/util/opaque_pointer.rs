use libc::c_void;

/// OpaquePointer represents pointers that quiesce needs to know about but
/// will not dereference. The managed-side "peer" object of a thread is an
/// opaque pointer for quiesce: it is only ever compared for identity (see
/// `ThreadList::suspend_thread_by_peer`) or handed back to the embedder.
/// The type does not provide any method for dereferencing.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct OpaquePointer(*mut c_void);

// We never really dereference an opaque pointer in quiesce.
unsafe impl Sync for OpaquePointer {}
unsafe impl Send for OpaquePointer {}

impl Default for OpaquePointer {
    fn default() -> Self {
        Self::UNINITIALIZED
    }
}

impl OpaquePointer {
    /// Represents an uninitialized value for [`OpaquePointer`].
    pub const UNINITIALIZED: Self = Self(0 as *mut c_void);

    /// Cast a raw pointer to an [`OpaquePointer`].
    pub fn from_mut_ptr<T>(ptr: *mut T) -> Self {
        OpaquePointer(ptr as *mut c_void)
    }

    /// Make an [`OpaquePointer`] from an arbitrary token. Embedders that
    /// identify threads by handle or index rather than by address use this.
    pub fn from_usize(raw: usize) -> Self {
        OpaquePointer(raw as *mut c_void)
    }

    /// The opaque pointer as a token.
    pub fn to_usize(self) -> usize {
        self.0 as usize
    }

    /// Is this opaque pointer null?
    pub fn is_null(self) -> bool {
        self.0.is_null()
    }
}
