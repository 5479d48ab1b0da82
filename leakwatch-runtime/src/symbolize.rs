//! Symbolization of allocation-site addresses.
//!
//! Runs only after the world has been resumed, so symbolizers are free to
//! allocate, take locks, and read debug info.

use std::fmt;

/// One resolved frame. An address may expand to several frames when calls
/// were inlined.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct SymbolizedFrame {
    /// The return address.
    pub address: usize,
    /// Demangled function name.
    pub function: Option<String>,
    /// Source file.
    pub file: Option<String>,
    /// Source line.
    pub line: Option<u32>,
    /// Path of the module containing the address.
    pub module: Option<String>,
    /// Offset of the address within its module.
    pub module_offset: Option<usize>,
}

impl SymbolizedFrame {
    /// A frame with nothing but its address.
    pub fn unknown(address: usize) -> Self {
        Self {
            address,
            ..Self::default()
        }
    }

    /// The names a suppression pattern is matched against.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.function
            .as_deref()
            .into_iter()
            .chain(self.file.as_deref())
            .chain(self.module.as_deref())
    }
}

impl fmt::Display for SymbolizedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.address)?;
        if let Some(function) = &self.function {
            write!(f, " in {}", function)?;
        }
        match (&self.file, self.line) {
            (Some(file), Some(line)) => write!(f, " {}:{}", file, line)?,
            (Some(file), None) => write!(f, " {}", file)?,
            _ => {
                if let (Some(module), Some(offset)) = (&self.module, self.module_offset) {
                    write!(f, " ({}+{:#x})", module, offset)?;
                }
            }
        }
        Ok(())
    }
}

/// Resolves return addresses to frames.
pub trait Symbolizer: Send + Sync {
    /// Resolve one address. Always returns at least one frame.
    fn symbolize(&self, address: usize) -> Vec<SymbolizedFrame>;
}

/// Symbolizer backed by the `backtrace` crate, with module lookup via
/// `dladdr`.
#[derive(Debug, Default, Clone, Copy)]
pub struct BacktraceSymbolizer;

impl Symbolizer for BacktraceSymbolizer {
    fn symbolize(&self, address: usize) -> Vec<SymbolizedFrame> {
        let (module, module_offset) = module_of(address);
        let mut frames = Vec::new();
        // Return addresses point just past the call instruction.
        let lookup = address.saturating_sub(1);
        backtrace::resolve(lookup as *mut std::ffi::c_void, |symbol| {
            frames.push(SymbolizedFrame {
                address,
                function: symbol.name().map(|name| name.to_string()),
                file: symbol.filename().map(|path| path.display().to_string()),
                line: symbol.lineno(),
                module: module.clone(),
                module_offset,
            });
        });
        if frames.is_empty() {
            frames.push(SymbolizedFrame {
                module,
                module_offset,
                ..SymbolizedFrame::unknown(address)
            });
        }
        frames
    }
}

/// Symbolizer that resolves nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSymbolizer;

impl Symbolizer for NullSymbolizer {
    fn symbolize(&self, address: usize) -> Vec<SymbolizedFrame> {
        vec![SymbolizedFrame::unknown(address)]
    }
}

#[cfg(unix)]
fn module_of(address: usize) -> (Option<String>, Option<usize>) {
    // SAFETY: dladdr only reads loader metadata; the returned strings are
    // owned by the loader and copied before returning.
    unsafe {
        let mut info: libc::Dl_info = std::mem::zeroed();
        if libc::dladdr(address as *const libc::c_void, &mut info) == 0 || info.dli_fname.is_null() {
            return (None, None);
        }
        let name = std::ffi::CStr::from_ptr(info.dli_fname).to_string_lossy().into_owned();
        let offset = address.wrapping_sub(info.dli_fbase as usize);
        (Some(name), Some(offset))
    }
}

#[cfg(not(unix))]
fn module_of(_address: usize) -> (Option<String>, Option<usize>) {
    (None, None)
}
