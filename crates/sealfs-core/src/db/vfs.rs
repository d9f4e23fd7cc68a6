//! An encrypting virtual filesystem for SQLite.
//!
//! [`EncryptedVfs`] registers a `sqlite3_vfs` whose file objects are
//! [`AesGcmRandomAccess`] streams layered over the host VFS's own files.
//! SQLite reads and writes page-aligned plaintext; the bytes that reach the
//! host filesystem are the block-cipher wire format. Locking, syncing, and
//! every non-file operation forward to the wrapped host VFS, except
//! randomness, which always comes from the process CSPRNG.
//!
//! SQLite is a C ABI: no Rust error or panic may cross it. Every callback
//! runs under `catch_unwind`, and failures collapse to `SQLITE_IOERR` after
//! being logged.

use std::alloc::{self, Layout};
use std::ffi::CString;
use std::os::raw::{c_char, c_int, c_void};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;
use std::sync::Arc;

use rusqlite::ffi;
use tracing::{debug, error, warn};
use zeroize::Zeroize;

use crate::error::{Error, Result};
use crate::io::crypto::OVERHEAD;
use crate::io::{AesGcmRandomAccess, RandomAccess};
use crate::rng::{fill_random, random_hex_string};

/// Alignment for the host VFS's file allocation. The host struct begins
/// with a `sqlite3_file`, but platform file records may embed wider types.
const HOST_FILE_ALIGN: usize = 16;

/// Parameters persisted per VFS registration.
#[derive(Clone)]
pub struct EncryptedVfsParams {
    /// 32-byte key for the backing file's block cipher stream.
    pub key: [u8; 32],
    /// Physical block size of the backing file; the plaintext sector SQLite
    /// sees is this minus the 28-byte per-block overhead.
    pub underlying_block_size: u64,
    /// Report files as immutable so the engine skips journaling.
    pub read_only: bool,
}

impl Drop for EncryptedVfsParams {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

struct VfsAppData {
    params: EncryptedVfsParams,
    host: *mut ffi::sqlite3_vfs,
}

/// A host `sqlite3_file` exposed as a [`RandomAccess`].
///
/// Owns both the file handle and its allocation: dropping the last `Arc`
/// closes the host file and frees the buffer the host VFS opened into.
struct SqliteHostFile {
    file: *mut ffi::sqlite3_file,
    layout: Layout,
}

unsafe impl Send for SqliteHostFile {}
unsafe impl Sync for SqliteHostFile {}

impl SqliteHostFile {
    fn raw(&self) -> *mut ffi::sqlite3_file {
        self.file
    }

    fn methods(&self) -> &ffi::sqlite3_io_methods {
        unsafe { &*(*self.file).pMethods }
    }
}

impl Drop for SqliteHostFile {
    fn drop(&mut self) {
        unsafe {
            if !(*self.file).pMethods.is_null() {
                if let Some(close) = (*(*self.file).pMethods).xClose {
                    let rc = close(self.file);
                    if rc != ffi::SQLITE_OK {
                        warn!(rc, "host VFS close failed");
                    }
                }
            }
            alloc::dealloc(self.file.cast(), self.layout);
        }
    }
}

fn host_error(rc: c_int, context: &'static str) -> Error {
    Error::Sql(rusqlite::Error::SqliteFailure(
        ffi::Error::new(rc),
        Some(context.to_owned()),
    ))
}

impl RandomAccess for SqliteHostFile {
    fn read(&self, offset: u64, output: &mut [u8]) -> Result<usize> {
        if output.is_empty() {
            return Ok(0);
        }
        // The host xRead reports short reads as an error; clamp at EOF so a
        // short read is an ordinary outcome, as RandomAccess requires.
        let current = self.size()?;
        if offset >= current {
            return Ok(0);
        }
        let len = output.len().min((current - offset) as usize);
        if len > c_int::MAX as usize {
            return Err(Error::invalid("read span exceeds the SQLite I/O limit"));
        }
        let read = self
            .methods()
            .xRead
            .ok_or_else(|| Error::internal("host VFS file lacks xRead"))?;
        let rc = unsafe {
            read(
                self.file,
                output.as_mut_ptr().cast::<c_void>(),
                len as c_int,
                offset as ffi::sqlite3_int64,
            )
        };
        if rc != ffi::SQLITE_OK {
            return Err(host_error(rc, "host VFS read failed"));
        }
        Ok(len)
    }

    fn write(&self, offset: u64, input: &[u8]) -> Result<()> {
        if input.is_empty() {
            return Ok(());
        }
        if input.len() > c_int::MAX as usize {
            return Err(Error::invalid("write span exceeds the SQLite I/O limit"));
        }
        let write = self
            .methods()
            .xWrite
            .ok_or_else(|| Error::internal("host VFS file lacks xWrite"))?;
        let rc = unsafe {
            write(
                self.file,
                input.as_ptr().cast::<c_void>(),
                input.len() as c_int,
                offset as ffi::sqlite3_int64,
            )
        };
        if rc != ffi::SQLITE_OK {
            return Err(host_error(rc, "host VFS write failed"));
        }
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        let file_size = self
            .methods()
            .xFileSize
            .ok_or_else(|| Error::internal("host VFS file lacks xFileSize"))?;
        let mut size: ffi::sqlite3_int64 = 0;
        let rc = unsafe { file_size(self.file, &mut size) };
        if rc != ffi::SQLITE_OK {
            return Err(host_error(rc, "host VFS size query failed"));
        }
        Ok(size as u64)
    }

    fn resize(&self, new_size: u64) -> Result<()> {
        let truncate = self
            .methods()
            .xTruncate
            .ok_or_else(|| Error::internal("host VFS file lacks xTruncate"))?;
        let rc = unsafe { truncate(self.file, new_size as ffi::sqlite3_int64) };
        if rc != ffi::SQLITE_OK {
            return Err(host_error(rc, "host VFS truncate failed"));
        }
        Ok(())
    }
}

/// Per-file state hanging off the wrapper record SQLite allocates.
struct FileState {
    host: Arc<SqliteHostFile>,
    io: AesGcmRandomAccess<SqliteHostFile>,
    read_only: bool,
}

/// The file record SQLite allocates inline (`szOsFile` bytes of it).
#[repr(C)]
struct EncryptedFile {
    base: ffi::sqlite3_file,
    state: *mut FileState,
}

/// Run a VFS callback body, converting panics into `SQLITE_IOERR`.
fn guarded(name: &'static str, f: impl FnOnce() -> c_int) -> c_int {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(rc) => rc,
        Err(_) => {
            error!(callback = name, "panic reached the SQLite VFS boundary");
            ffi::SQLITE_IOERR
        }
    }
}

unsafe fn app_of<'a>(vfs: *mut ffi::sqlite3_vfs) -> &'a VfsAppData {
    &*(*vfs).pAppData.cast::<VfsAppData>()
}

unsafe fn state_of<'a>(file: *mut ffi::sqlite3_file) -> Option<&'a FileState> {
    let state = (*file.cast::<EncryptedFile>()).state;
    if state.is_null() {
        None
    } else {
        Some(&*state)
    }
}

// ---------------------------------------------------------------------------
// sqlite3_io_methods callbacks
// ---------------------------------------------------------------------------

unsafe extern "C" fn x_close(file: *mut ffi::sqlite3_file) -> c_int {
    guarded("xClose", || unsafe {
        let wrapper = file.cast::<EncryptedFile>();
        let state = (*wrapper).state;
        if !state.is_null() {
            drop(Box::from_raw(state));
            (*wrapper).state = ptr::null_mut();
        }
        ffi::SQLITE_OK
    })
}

unsafe extern "C" fn x_read(
    file: *mut ffi::sqlite3_file,
    buffer: *mut c_void,
    amount: c_int,
    offset: ffi::sqlite3_int64,
) -> c_int {
    guarded("xRead", || unsafe {
        let Some(state) = state_of(file) else {
            return ffi::SQLITE_MISUSE;
        };
        if amount < 0 || offset < 0 {
            return ffi::SQLITE_MISUSE;
        }
        let output = std::slice::from_raw_parts_mut(buffer.cast::<u8>(), amount as usize);
        match state.io.read(offset as u64, output) {
            Ok(n) if n < output.len() => ffi::SQLITE_IOERR_SHORT_READ,
            Ok(_) => ffi::SQLITE_OK,
            Err(e) => {
                warn!(error = %e, "encrypted read failed under SQLite");
                ffi::SQLITE_IOERR
            }
        }
    })
}

unsafe extern "C" fn x_write(
    file: *mut ffi::sqlite3_file,
    buffer: *const c_void,
    amount: c_int,
    offset: ffi::sqlite3_int64,
) -> c_int {
    guarded("xWrite", || unsafe {
        let Some(state) = state_of(file) else {
            return ffi::SQLITE_MISUSE;
        };
        if amount < 0 || offset < 0 {
            return ffi::SQLITE_MISUSE;
        }
        let input = std::slice::from_raw_parts(buffer.cast::<u8>(), amount as usize);
        match state.io.write(offset as u64, input) {
            Ok(()) => ffi::SQLITE_OK,
            Err(e) => {
                warn!(error = %e, "encrypted write failed under SQLite");
                ffi::SQLITE_IOERR
            }
        }
    })
}

unsafe extern "C" fn x_truncate(
    file: *mut ffi::sqlite3_file,
    size: ffi::sqlite3_int64,
) -> c_int {
    guarded("xTruncate", || unsafe {
        let Some(state) = state_of(file) else {
            return ffi::SQLITE_MISUSE;
        };
        if size < 0 {
            return ffi::SQLITE_MISUSE;
        }
        match state.io.resize(size as u64) {
            Ok(()) => ffi::SQLITE_OK,
            Err(e) => {
                warn!(error = %e, "encrypted truncate failed under SQLite");
                ffi::SQLITE_IOERR
            }
        }
    })
}

unsafe extern "C" fn x_sync(file: *mut ffi::sqlite3_file, flags: c_int) -> c_int {
    guarded("xSync", || unsafe {
        let Some(state) = state_of(file) else {
            return ffi::SQLITE_MISUSE;
        };
        match state.host.methods().xSync {
            Some(sync) => sync(state.host.raw(), flags),
            None => ffi::SQLITE_OK,
        }
    })
}

unsafe extern "C" fn x_file_size(
    file: *mut ffi::sqlite3_file,
    out_size: *mut ffi::sqlite3_int64,
) -> c_int {
    guarded("xFileSize", || unsafe {
        let Some(state) = state_of(file) else {
            return ffi::SQLITE_MISUSE;
        };
        match state.io.size() {
            Ok(size) => {
                *out_size = size as ffi::sqlite3_int64;
                ffi::SQLITE_OK
            }
            Err(e) => {
                warn!(error = %e, "encrypted size query failed under SQLite");
                ffi::SQLITE_IOERR
            }
        }
    })
}

unsafe extern "C" fn x_lock(file: *mut ffi::sqlite3_file, level: c_int) -> c_int {
    guarded("xLock", || unsafe {
        let Some(state) = state_of(file) else {
            return ffi::SQLITE_MISUSE;
        };
        match state.host.methods().xLock {
            Some(lock) => lock(state.host.raw(), level),
            None => ffi::SQLITE_OK,
        }
    })
}

unsafe extern "C" fn x_unlock(file: *mut ffi::sqlite3_file, level: c_int) -> c_int {
    guarded("xUnlock", || unsafe {
        let Some(state) = state_of(file) else {
            return ffi::SQLITE_MISUSE;
        };
        match state.host.methods().xUnlock {
            Some(unlock) => unlock(state.host.raw(), level),
            None => ffi::SQLITE_OK,
        }
    })
}

unsafe extern "C" fn x_check_reserved_lock(
    file: *mut ffi::sqlite3_file,
    out_result: *mut c_int,
) -> c_int {
    guarded("xCheckReservedLock", || unsafe {
        let Some(state) = state_of(file) else {
            return ffi::SQLITE_MISUSE;
        };
        match state.host.methods().xCheckReservedLock {
            Some(check) => check(state.host.raw(), out_result),
            None => {
                *out_result = 0;
                ffi::SQLITE_OK
            }
        }
    })
}

unsafe extern "C" fn x_file_control(
    file: *mut ffi::sqlite3_file,
    op: c_int,
    arg: *mut c_void,
) -> c_int {
    guarded("xFileControl", || unsafe {
        let Some(state) = state_of(file) else {
            return ffi::SQLITE_MISUSE;
        };
        let forward = |state: &FileState| unsafe {
            match state.host.methods().xFileControl {
                Some(control) => control(state.host.raw(), op, arg),
                None => ffi::SQLITE_NOTFOUND,
            }
        };
        match op {
            ffi::SQLITE_FCNTL_SIZE_HINT => {
                // The engine hints at the logical file size it is about to
                // need; the host must reserve the physical equivalent.
                let hint = arg.cast::<ffi::sqlite3_int64>();
                if !hint.is_null() && *hint >= 0 {
                    let v = state.io.virtual_block_size();
                    let p = state.io.underlying_block_size();
                    *hint = ((*hint as u64).div_ceil(v) * p) as ffi::sqlite3_int64;
                }
                forward(state)
            }
            ffi::SQLITE_FCNTL_LOCKSTATE | ffi::SQLITE_FCNTL_TEMPFILENAME => forward(state),
            _ => ffi::SQLITE_NOTFOUND,
        }
    })
}

unsafe extern "C" fn x_sector_size(file: *mut ffi::sqlite3_file) -> c_int {
    guarded("xSectorSize", || unsafe {
        match state_of(file) {
            // Plaintext sector = virtual block, so the engine aligns its
            // pages to what one encrypted block can hold.
            Some(state) => state.io.virtual_block_size() as c_int,
            None => 512,
        }
    })
}

unsafe extern "C" fn x_device_characteristics(file: *mut ffi::sqlite3_file) -> c_int {
    guarded("xDeviceCharacteristics", || unsafe {
        let Some(state) = state_of(file) else {
            return 0;
        };
        let base = match state.host.methods().xDeviceCharacteristics {
            Some(characteristics) => characteristics(state.host.raw()),
            None => 0,
        };
        if state.read_only {
            base | ffi::SQLITE_IOCAP_IMMUTABLE
        } else {
            base
        }
    })
}

static ENCRYPTED_IO_METHODS: ffi::sqlite3_io_methods = ffi::sqlite3_io_methods {
    iVersion: 1,
    xClose: Some(x_close),
    xRead: Some(x_read),
    xWrite: Some(x_write),
    xTruncate: Some(x_truncate),
    xSync: Some(x_sync),
    xFileSize: Some(x_file_size),
    xLock: Some(x_lock),
    xUnlock: Some(x_unlock),
    xCheckReservedLock: Some(x_check_reserved_lock),
    xFileControl: Some(x_file_control),
    xSectorSize: Some(x_sector_size),
    xDeviceCharacteristics: Some(x_device_characteristics),
    xShmMap: None,
    xShmLock: None,
    xShmBarrier: None,
    xShmUnmap: None,
    xFetch: None,
    xUnfetch: None,
};

// ---------------------------------------------------------------------------
// sqlite3_vfs callbacks
// ---------------------------------------------------------------------------

unsafe extern "C" fn vfs_open(
    vfs: *mut ffi::sqlite3_vfs,
    name: *const c_char,
    file: *mut ffi::sqlite3_file,
    flags: c_int,
    out_flags: *mut c_int,
) -> c_int {
    guarded("xOpen", || unsafe {
        let wrapper = file.cast::<EncryptedFile>();
        // SQLite only calls xClose if pMethods is set; make failure safe.
        (*wrapper).base.pMethods = ptr::null();
        (*wrapper).state = ptr::null_mut();

        let app = app_of(vfs);
        let host_vfs = app.host;
        let Some(host_open) = (*host_vfs).xOpen else {
            return ffi::SQLITE_IOERR;
        };

        let Ok(layout) = Layout::from_size_align((*host_vfs).szOsFile as usize, HOST_FILE_ALIGN)
        else {
            return ffi::SQLITE_IOERR;
        };
        let host_file = alloc::alloc_zeroed(layout).cast::<ffi::sqlite3_file>();
        if host_file.is_null() {
            return ffi::SQLITE_NOMEM;
        }
        let rc = host_open(host_vfs, name, host_file, flags, out_flags);
        if rc != ffi::SQLITE_OK {
            alloc::dealloc(host_file.cast(), layout);
            return rc;
        }
        let host = Arc::new(SqliteHostFile {
            file: host_file,
            layout,
        });

        let read_only = app.params.read_only || (flags & ffi::SQLITE_OPEN_READONLY) != 0;
        let io = match AesGcmRandomAccess::new(
            host.clone(),
            &app.params.key,
            app.params.underlying_block_size,
            read_only,
        ) {
            Ok(io) => io,
            Err(e) => {
                warn!(error = %e, "cannot layer cipher stream over host file");
                return ffi::SQLITE_CANTOPEN;
            }
        };

        (*wrapper).state = Box::into_raw(Box::new(FileState {
            host,
            io,
            read_only,
        }));
        (*wrapper).base.pMethods = &ENCRYPTED_IO_METHODS;
        ffi::SQLITE_OK
    })
}

unsafe extern "C" fn vfs_delete(
    vfs: *mut ffi::sqlite3_vfs,
    name: *const c_char,
    sync_dir: c_int,
) -> c_int {
    guarded("xDelete", || unsafe {
        let host = app_of(vfs).host;
        match (*host).xDelete {
            Some(delete) => delete(host, name, sync_dir),
            None => ffi::SQLITE_IOERR,
        }
    })
}

unsafe extern "C" fn vfs_access(
    vfs: *mut ffi::sqlite3_vfs,
    name: *const c_char,
    flags: c_int,
    out_result: *mut c_int,
) -> c_int {
    guarded("xAccess", || unsafe {
        let host = app_of(vfs).host;
        match (*host).xAccess {
            Some(access) => access(host, name, flags, out_result),
            None => ffi::SQLITE_IOERR,
        }
    })
}

unsafe extern "C" fn vfs_full_pathname(
    vfs: *mut ffi::sqlite3_vfs,
    name: *const c_char,
    out_len: c_int,
    out: *mut c_char,
) -> c_int {
    guarded("xFullPathname", || unsafe {
        let host = app_of(vfs).host;
        match (*host).xFullPathname {
            Some(full_pathname) => full_pathname(host, name, out_len, out),
            None => ffi::SQLITE_IOERR,
        }
    })
}

unsafe extern "C" fn vfs_dl_open(
    vfs: *mut ffi::sqlite3_vfs,
    filename: *const c_char,
) -> *mut c_void {
    let host = app_of(vfs).host;
    match (*host).xDlOpen {
        Some(dl_open) => dl_open(host, filename),
        None => ptr::null_mut(),
    }
}

unsafe extern "C" fn vfs_dl_error(vfs: *mut ffi::sqlite3_vfs, len: c_int, msg: *mut c_char) {
    let host = app_of(vfs).host;
    if let Some(dl_error) = (*host).xDlError {
        dl_error(host, len, msg);
    }
}

unsafe extern "C" fn vfs_dl_sym(
    vfs: *mut ffi::sqlite3_vfs,
    handle: *mut c_void,
    symbol: *const c_char,
) -> Option<unsafe extern "C" fn(*mut ffi::sqlite3_vfs, *mut c_void, *const c_char)> {
    let host = app_of(vfs).host;
    match (*host).xDlSym {
        Some(dl_sym) => dl_sym(host, handle, symbol),
        None => None,
    }
}

unsafe extern "C" fn vfs_dl_close(vfs: *mut ffi::sqlite3_vfs, handle: *mut c_void) {
    let host = app_of(vfs).host;
    if let Some(dl_close) = (*host).xDlClose {
        dl_close(host, handle);
    }
}

unsafe extern "C" fn vfs_randomness(
    _vfs: *mut ffi::sqlite3_vfs,
    len: c_int,
    out: *mut c_char,
) -> c_int {
    guarded("xRandomness", || unsafe {
        if len <= 0 || out.is_null() {
            return 0;
        }
        let buffer = std::slice::from_raw_parts_mut(out.cast::<u8>(), len as usize);
        fill_random(buffer);
        len
    })
}

unsafe extern "C" fn vfs_sleep(vfs: *mut ffi::sqlite3_vfs, microseconds: c_int) -> c_int {
    guarded("xSleep", || unsafe {
        let host = app_of(vfs).host;
        match (*host).xSleep {
            Some(sleep) => sleep(host, microseconds),
            None => {
                std::thread::sleep(std::time::Duration::from_micros(microseconds.max(0) as u64));
                microseconds
            }
        }
    })
}

unsafe extern "C" fn vfs_current_time(vfs: *mut ffi::sqlite3_vfs, out: *mut f64) -> c_int {
    guarded("xCurrentTime", || unsafe {
        let host = app_of(vfs).host;
        match (*host).xCurrentTime {
            Some(current_time) => current_time(host, out),
            None => ffi::SQLITE_IOERR,
        }
    })
}

unsafe extern "C" fn vfs_get_last_error(
    vfs: *mut ffi::sqlite3_vfs,
    len: c_int,
    out: *mut c_char,
) -> c_int {
    guarded("xGetLastError", || unsafe {
        let host = app_of(vfs).host;
        match (*host).xGetLastError {
            Some(get_last_error) => get_last_error(host, len, out),
            None => 0,
        }
    })
}

unsafe extern "C" fn vfs_current_time_int64(
    vfs: *mut ffi::sqlite3_vfs,
    out: *mut ffi::sqlite3_int64,
) -> c_int {
    guarded("xCurrentTimeInt64", || unsafe {
        let host = app_of(vfs).host;
        if (*host).iVersion >= 2 {
            if let Some(current_time_int64) = (*host).xCurrentTimeInt64 {
                return current_time_int64(host, out);
            }
        }
        // Fall back to the julian-day float clock.
        match (*host).xCurrentTime {
            Some(current_time) => {
                let mut julian_day = 0f64;
                let rc = current_time(host, &mut julian_day);
                if rc == ffi::SQLITE_OK {
                    *out = (julian_day * 86_400_000.0) as ffi::sqlite3_int64;
                }
                rc
            }
            None => ffi::SQLITE_IOERR,
        }
    })
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// A registered encrypting VFS.
///
/// Each instance registers under a unique generated name, so several
/// repositories with different keys can coexist in one process. The
/// registration outlives every connection opened through it and is removed
/// on drop.
#[derive(Debug)]
pub struct EncryptedVfs {
    vfs: *mut ffi::sqlite3_vfs,
    app_data: *mut VfsAppData,
    // Keeps `zName` alive for the registration's lifetime.
    _name: CString,
    name: String,
}

unsafe impl Send for EncryptedVfs {}
unsafe impl Sync for EncryptedVfs {}

impl EncryptedVfs {
    pub fn new(params: EncryptedVfsParams) -> Result<Self> {
        if params.underlying_block_size <= OVERHEAD {
            return Err(Error::invalid(format!(
                "VFS block size {} does not exceed the {OVERHEAD}-byte overhead",
                params.underlying_block_size
            )));
        }
        let host = unsafe { ffi::sqlite3_vfs_find(ptr::null()) };
        if host.is_null() {
            return Err(Error::internal("no default SQLite VFS registered"));
        }

        let name = format!("sealfs-{}", random_hex_string(8));
        let c_name = CString::new(name.clone())
            .map_err(|_| Error::internal("generated VFS name contains NUL"))?;

        let app_data = Box::into_raw(Box::new(VfsAppData { params, host }));
        let vfs = Box::into_raw(Box::new(ffi::sqlite3_vfs {
            iVersion: 2,
            szOsFile: std::mem::size_of::<EncryptedFile>() as c_int,
            mxPathname: unsafe { (*host).mxPathname },
            pNext: ptr::null_mut(),
            zName: c_name.as_ptr(),
            pAppData: app_data.cast(),
            xOpen: Some(vfs_open),
            xDelete: Some(vfs_delete),
            xAccess: Some(vfs_access),
            xFullPathname: Some(vfs_full_pathname),
            xDlOpen: Some(vfs_dl_open),
            xDlError: Some(vfs_dl_error),
            xDlSym: Some(vfs_dl_sym),
            xDlClose: Some(vfs_dl_close),
            xRandomness: Some(vfs_randomness),
            xSleep: Some(vfs_sleep),
            xCurrentTime: Some(vfs_current_time),
            xGetLastError: Some(vfs_get_last_error),
            xCurrentTimeInt64: Some(vfs_current_time_int64),
            xSetSystemCall: None,
            xGetSystemCall: None,
            xNextSystemCall: None,
        }));

        let rc = unsafe { ffi::sqlite3_vfs_register(vfs, 0) };
        if rc != ffi::SQLITE_OK {
            unsafe {
                drop(Box::from_raw(vfs));
                drop(Box::from_raw(app_data));
            }
            return Err(host_error(rc, "VFS registration failed"));
        }
        debug!(vfs = %name, "registered encrypting SQLite VFS");
        Ok(Self {
            vfs,
            app_data,
            _name: c_name,
            name,
        })
    }

    /// The registered name, for `Connection::open_with_flags_and_vfs`.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for EncryptedVfs {
    fn drop(&mut self) {
        unsafe {
            let rc = ffi::sqlite3_vfs_unregister(self.vfs);
            if rc != ffi::SQLITE_OK {
                warn!(rc, vfs = %self.name, "VFS unregistration failed");
            }
            drop(Box::from_raw(self.vfs));
            drop(Box::from_raw(self.app_data));
        }
    }
}
