//! Host dynamic-library access.
//!
//! Programs reach host code in three steps: open a module by path,
//! resolve an entry point by symbol name, invoke it. The machine only
//! ever sees [`Handle`] words; the loader behind them is swappable so
//! embedders (and tests) can interpose their own resolution.

use std::collections::HashMap;
use std::ffi::CStr;

use libloading::Library;

use crate::machine::Vm;
use crate::object::Handle;

/// ABI of a resolved entry point. The native receives the machine and
/// may push, pop, touch memory and set the error register through the
/// public API; the returned status is currently discarded.
pub type NativeFn = unsafe extern "C" fn(*mut Vm) -> u32;

/// Module resolution capability. A null handle signals failure; the
/// machine pushes it for the program to inspect rather than raising an
/// error, mirroring how the host's own loader reports.
pub trait NativeLoader {
    /// Open the module at `name`. `flags` are host loader flags,
    /// passed through where the platform honors them.
    fn open(&mut self, name: &CStr, flags: i64) -> Handle;

    /// Close a previously opened module. Entry points resolved from it
    /// are dangling afterwards; the machine cannot detect their use.
    fn close(&mut self, handle: Handle);

    /// Resolve `symbol` in an open module to its raw entry address.
    fn resolve(&mut self, handle: Handle, symbol: &CStr) -> Handle;
}

/// The default loader, backed by the host's dynamic linker. Modules
/// are kept in a registry keyed by minted handles, so the words on the
/// program's stack never carry raw linker pointers.
pub struct DlLoader {
    modules: HashMap<u64, Library>,
    next_handle: u64,
}

impl DlLoader {
    pub fn new() -> Self {
        DlLoader {
            modules: HashMap::new(),
            next_handle: 1,
        }
    }

    #[cfg(unix)]
    fn open_library(name: &CStr, flags: i64) -> Option<Library> {
        use std::os::unix::ffi::OsStrExt;

        let path = std::ffi::OsStr::from_bytes(name.to_bytes());
        let library = unsafe {
            libloading::os::unix::Library::open(Some(path), flags as std::os::raw::c_int)
        };
        library.ok().map(Library::from)
    }

    #[cfg(not(unix))]
    fn open_library(name: &CStr, _flags: i64) -> Option<Library> {
        let path = name.to_str().ok()?;
        unsafe { Library::new(path) }.ok()
    }
}

impl Default for DlLoader {
    fn default() -> Self {
        DlLoader::new()
    }
}

impl NativeLoader for DlLoader {
    fn open(&mut self, name: &CStr, flags: i64) -> Handle {
        let Some(library) = Self::open_library(name, flags) else {
            return Handle::NULL;
        };
        let handle = Handle::from_raw(self.next_handle);
        self.next_handle += 1;
        self.modules.insert(handle.raw(), library);
        handle
    }

    fn close(&mut self, handle: Handle) {
        self.modules.remove(&handle.raw());
    }

    fn resolve(&mut self, handle: Handle, symbol: &CStr) -> Handle {
        let Some(library) = self.modules.get(&handle.raw()) else {
            return Handle::NULL;
        };
        let entry = unsafe { library.get::<NativeFn>(symbol.to_bytes_with_nul()) };
        match entry {
            Ok(entry) => Handle::from_raw(*entry as usize as u64),
            Err(_) => Handle::NULL,
        }
    }
}
