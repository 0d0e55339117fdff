//! C FFI bridging [`ChatterboxOnnx`] to iOS / Android callers.
//!
//! Functions are `#[no_mangle] extern "C"` so Swift / Kotlin (via JNI) can call
//! them through a thin bridging header.
//!
//! ## Memory contract
//!
//! | Function                           | Caller frees with          |
//! |------------------------------------|----------------------------|
//! | [`chatterbox_model_load`]          | [`chatterbox_model_free`]  |
//! | [`chatterbox_synthesize_to_file`]  | [`chatterbox_free_error`]  |

use std::ffi::{c_char, CStr, CString};
use std::path::Path;

use tracing::error;

use crate::{
    device::{cuda_available, select_device, DevicePreference},
    model::ChatterboxOnnx,
    options::{GenerateConfig, ModelSource, Precision},
};

/// Opaque handle to a loaded Chatterbox model.
pub struct ChatterboxHandle {
    model: ChatterboxOnnx,
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Convert a `*const c_char` to an owned `String`; `None` if `ptr` is null.
unsafe fn cstr_to_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
}

/// Heap-allocate an owned C string.  Returns null on interior nul bytes.
fn to_c_str(s: &str) -> *const c_char {
    match CString::new(s) {
        Ok(cs) => cs.into_raw(),
        Err(_) => std::ptr::null(),
    }
}

// ─── Public API ──────────────────────────────────────────────────────────────

/// Load a Chatterbox model.
///
/// @param source  UTF-8 model directory (mobile: the bundled copy) or, on
///                desktop, a HuggingFace repository id.
/// @param device  `"auto"`, `"cpu"` or `"cuda"`; `NULL` means `"auto"`.
/// @return        Opaque model handle, or `NULL` on failure (details logged).
///                Free with [`chatterbox_model_free`].
#[no_mangle]
pub unsafe extern "C" fn chatterbox_model_load(
    source: *const c_char,
    device: *const c_char,
) -> *mut ChatterboxHandle {
    let Some(source) = (unsafe { cstr_to_string(source) }) else {
        error!("chatterbox_model_load: null source");
        return std::ptr::null_mut();
    };
    let pref = match unsafe { cstr_to_string(device) } {
        None => DevicePreference::Auto,
        Some(s) => match s.parse() {
            Ok(p) => p,
            Err(e) => {
                error!("chatterbox_model_load: {e:#}");
                return std::ptr::null_mut();
            }
        },
    };

    let device = select_device(pref, cuda_available);
    match ChatterboxOnnx::from_source(&ModelSource::parse(&source), Precision::Fp32, device) {
        Ok(model) => Box::into_raw(Box::new(ChatterboxHandle { model })),
        Err(e) => {
            error!("Error loading model: {e:#}");
            std::ptr::null_mut()
        }
    }
}

/// Sample rate of the audio the model writes, or 0 for a null handle.
#[no_mangle]
pub unsafe extern "C" fn chatterbox_model_sample_rate(model: *const ChatterboxHandle) -> u32 {
    if model.is_null() {
        return 0;
    }
    unsafe { &*model }.model.sample_rate()
}

/// Synthesise `text` in the voice of `reference` and write a 16-bit WAV.
///
/// @param model        Handle from [`chatterbox_model_load`].
/// @param text         UTF-8 text to speak.
/// @param reference    Path of the reference voice clip.
/// @param output_path  Writable path for the output `.wav` file.
/// @return             `NULL` on success; on failure a heap-allocated UTF-8 error
///                     message that the caller must release with
///                     [`chatterbox_free_error`].
#[no_mangle]
pub unsafe extern "C" fn chatterbox_synthesize_to_file(
    model: *const ChatterboxHandle,
    text: *const c_char,
    reference: *const c_char,
    output_path: *const c_char,
) -> *const c_char {
    if model.is_null() {
        return to_c_str("null model handle");
    }
    let (Some(txt), Some(reference), Some(out)) = (
        unsafe { cstr_to_string(text) },
        unsafe { cstr_to_string(reference) },
        unsafe { cstr_to_string(output_path) },
    ) else {
        return to_c_str("null argument (text, reference, or output_path)");
    };

    let h = unsafe { &*model };
    match h.model.generate_to_file(
        &txt,
        Path::new(&reference),
        Path::new(&out),
        &GenerateConfig::default(),
    ) {
        Ok(()) => std::ptr::null(),
        Err(e) => to_c_str(&format!("{e:#}")),
    }
}

/// Free an error string returned by [`chatterbox_synthesize_to_file`].
#[no_mangle]
pub unsafe extern "C" fn chatterbox_free_error(s: *const c_char) {
    if !s.is_null() {
        drop(unsafe { CString::from_raw(s as *mut c_char) });
    }
}

/// Destroy a model handle and release all resources.
#[no_mangle]
pub unsafe extern "C" fn chatterbox_model_free(model: *mut ChatterboxHandle) {
    if !model.is_null() {
        drop(unsafe { Box::from_raw(model) });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_and_free(err: *const c_char) -> String {
        assert!(!err.is_null());
        let msg = unsafe { CStr::from_ptr(err) }.to_string_lossy().into_owned();
        unsafe { chatterbox_free_error(err) };
        msg
    }

    #[test]
    fn test_load_null_source() {
        let h = unsafe { chatterbox_model_load(std::ptr::null(), std::ptr::null()) };
        assert!(h.is_null());
    }

    #[test]
    fn test_load_bad_device() {
        let src = CString::new("/tmp").unwrap();
        let dev = CString::new("tpu").unwrap();
        let h = unsafe { chatterbox_model_load(src.as_ptr(), dev.as_ptr()) };
        assert!(h.is_null());
    }

    #[test]
    fn test_load_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        let src = CString::new(dir.path().to_str().unwrap()).unwrap();
        let dev = CString::new("cpu").unwrap();
        let h = unsafe { chatterbox_model_load(src.as_ptr(), dev.as_ptr()) };
        assert!(h.is_null());
    }

    #[test]
    fn test_synthesize_null_handle() {
        let text = CString::new("hi").unwrap();
        let err = unsafe {
            chatterbox_synthesize_to_file(
                std::ptr::null(),
                text.as_ptr(),
                text.as_ptr(),
                text.as_ptr(),
            )
        };
        assert_eq!(read_and_free(err), "null model handle");
    }

    #[test]
    fn test_null_handles_are_harmless() {
        assert_eq!(unsafe { chatterbox_model_sample_rate(std::ptr::null()) }, 0);
        unsafe { chatterbox_model_free(std::ptr::null_mut()) };
        unsafe { chatterbox_free_error(std::ptr::null()) };
    }
}
