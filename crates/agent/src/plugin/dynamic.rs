use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::path::Path;
use std::sync::Arc;

use libloading::Library;
use serde_json::Value;

use crate::model::EventGroup;
use crate::pipeline::{ConfigError, PipelineContext};
use crate::processor::Processor;

/// Interface version a loadable processor must report.
pub const PROCESSOR_INTERFACE_VERSION: c_int = 100;

/// Symbol every processor library exports.
pub const INTERFACE_SYMBOL: &[u8] = b"processor_interface";

pub type ProcessorInitFn =
    unsafe extern "C" fn(ins: *mut ProcessorInstanceT, config: *mut c_void, context: *mut c_void) -> c_int;
pub type ProcessorFinalizeFn = unsafe extern "C" fn(plugin_state: *mut c_void);
pub type ProcessorProcessFn = unsafe extern "C" fn(plugin_state: *mut c_void, log_group: *mut c_void);

/// Function-pointer table exported by a dynamic processor. Layout is the
/// stable ABI; field order must not change.
#[repr(C)]
pub struct ProcessorInterfaceT {
    pub version: c_int,
    pub name: *const c_char,
    pub language: *const c_char,
    pub init: Option<ProcessorInitFn>,
    pub finalize: Option<ProcessorFinalizeFn>,
    pub process: Option<ProcessorProcessFn>,
}

#[repr(C)]
pub struct ProcessorInstanceT {
    pub plugin: *const ProcessorInterfaceT,
    pub plugin_state: *mut c_void,
}

/// A loaded processor library. Owns the `Library` handle for the life of
/// the process; the interface table points into the mapped image.
pub struct DynamicProcessorLib {
    _lib: Library,
    interface: *const ProcessorInterfaceT,
    name: String,
    language: String,
}

impl std::fmt::Debug for DynamicProcessorLib {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicProcessorLib")
            .field("name", &self.name)
            .field("language", &self.language)
            .finish()
    }
}

// The interface table is immutable static data inside the library image.
unsafe impl Send for DynamicProcessorLib {}
unsafe impl Sync for DynamicProcessorLib {}

impl DynamicProcessorLib {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let lib = unsafe { Library::new(path) }.map_err(|e| {
            ConfigError::PluginLoad(format!("cannot open {}: {e}", path.display()))
        })?;
        let interface: *const ProcessorInterfaceT = unsafe {
            match lib.get::<*const ProcessorInterfaceT>(INTERFACE_SYMBOL) {
                Ok(symbol) => *symbol,
                Err(e) => {
                    return Err(ConfigError::PluginLoad(format!(
                        "{} does not export processor_interface: {e}",
                        path.display()
                    )))
                }
            }
        };
        if interface.is_null() {
            return Err(ConfigError::PluginLoad(format!(
                "{}: processor_interface is null",
                path.display()
            )));
        }
        let version = unsafe { (*interface).version };
        if version != PROCESSOR_INTERFACE_VERSION {
            return Err(ConfigError::PluginLoad(format!(
                "{}: interface version mismatch, expected {PROCESSOR_INTERFACE_VERSION}, got {version}",
                path.display()
            )));
        }
        let name = unsafe { cstr_field((*interface).name) }.ok_or_else(|| {
            ConfigError::PluginLoad(format!("{}: plugin has no name", path.display()))
        })?;
        let language = unsafe { cstr_field((*interface).language) }.unwrap_or_else(|| "C".to_string());
        if unsafe { (*interface).init.is_none() || (*interface).process.is_none() } {
            return Err(ConfigError::PluginLoad(format!(
                "{}: init/process entry points are missing",
                path.display()
            )));
        }
        tracing::info!(plugin = %name, language = %language, path = %path.display(), "loaded dynamic processor");
        Ok(Self {
            _lib: lib,
            interface,
            name,
            language,
        })
    }

    pub fn plugin_name(&self) -> &str {
        &self.name
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn instantiate(self: &Arc<Self>) -> Box<dyn Processor> {
        Box::new(DynamicProcessor {
            lib: Arc::clone(self),
            instance: ProcessorInstanceT {
                plugin: self.interface,
                plugin_state: std::ptr::null_mut(),
            },
            initialized: false,
        })
    }
}

/// Proxy that drives one instance of a loaded processor through the
/// [`Processor`] seam. The event group crosses the boundary as an opaque
/// pointer; config crosses as a JSON C string.
pub struct DynamicProcessor {
    lib: Arc<DynamicProcessorLib>,
    instance: ProcessorInstanceT,
    initialized: bool,
}

// plugin_state is only touched from &self/&mut self through the C entry
// points, which the ABI requires to be thread-safe for pipeline use.
unsafe impl Send for DynamicProcessor {}
unsafe impl Sync for DynamicProcessor {}

impl Processor for DynamicProcessor {
    fn name(&self) -> &'static str {
        "processor_dynamic_c"
    }

    fn init(&mut self, config: &Value, _ctx: Arc<PipelineContext>) -> Result<(), ConfigError> {
        let config_json = CString::new(config.to_string()).map_err(|_| {
            ConfigError::PluginLoad("plugin config contains an interior NUL".to_string())
        })?;
        let init = unsafe { (*self.instance.plugin).init }.ok_or_else(|| {
            ConfigError::PluginLoad(format!("{}: init is missing", self.lib.plugin_name()))
        })?;
        let rc = unsafe {
            init(
                &mut self.instance,
                config_json.as_ptr() as *mut c_void,
                std::ptr::null_mut(),
            )
        };
        if rc != 0 {
            return Err(ConfigError::PluginLoad(format!(
                "{}: init returned {rc}",
                self.lib.plugin_name()
            )));
        }
        self.initialized = true;
        Ok(())
    }

    fn process(&self, group: &mut EventGroup) {
        if !self.initialized {
            return;
        }
        if let Some(process) = unsafe { (*self.instance.plugin).process } {
            unsafe { process(self.instance.plugin_state, group as *mut EventGroup as *mut c_void) };
        }
    }
}

impl Drop for DynamicProcessor {
    fn drop(&mut self) {
        if self.initialized {
            if let Some(finalize) = unsafe { (*self.instance.plugin).finalize } {
                unsafe { finalize(self.instance.plugin_state) };
            }
        }
    }
}

unsafe fn cstr_field(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok().map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abi_layout_matches_contract() {
        // The C side reads these fields by offset; a packing change would
        // silently corrupt the handshake.
        assert_eq!(std::mem::size_of::<c_int>(), 4);
        assert_eq!(
            std::mem::size_of::<ProcessorInterfaceT>(),
            std::mem::size_of::<usize>() * 5 + std::mem::align_of::<*const c_char>(),
        );
        assert_eq!(
            std::mem::size_of::<ProcessorInstanceT>(),
            std::mem::size_of::<usize>() * 2
        );
    }

    #[test]
    fn test_load_missing_library_fails() {
        let err = DynamicProcessorLib::load(Path::new("/nonexistent/libplugin.so")).unwrap_err();
        assert!(matches!(err, ConfigError::PluginLoad(_)));
    }
}
