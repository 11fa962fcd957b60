//! C ABI over the flat engine.
//!
//! Every entry point returns [`MICROPORT_OK`] on success, a positive
//! [`microport_core::ErrorKind::code`] for pipeline failures, or one of the negative
//! `MICROPORT_ERR_*` statuses for problems with the call itself. Failures are
//! reported through `tracing` before returning.

use std::cell::Cell;
use std::ffi::{c_int, c_void};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::slice;

use microport_backend_flat::FlatEngine;
use microport_core::{Hwc, PipelineError};
use microport_runtime::Pipeline;
use tracing::warn;

pub const MICROPORT_OK: c_int = 0;
pub const MICROPORT_ERR_NULL_ARGUMENT: c_int = -1;
/// A canonical dimension does not fit in `u32`.
pub const MICROPORT_ERR_DIMENSION_OVERFLOW: c_int = -2;
pub const MICROPORT_ERR_PANIC: c_int = -3;
/// `model_len` or `tensor_arena_size` exceeds `isize::MAX`.
pub const MICROPORT_ERR_LENGTH_OVERFLOW: c_int = -4;

/// Receives the input buffer to fill, with its canonical height, width and
/// channel count. The buffer holds `height * width * channels` floats.
pub type MicroportInputCallback =
    Option<unsafe extern "C" fn(user_data: *mut c_void, data: *mut f32, height: u32, width: u32, channels: u32)>;

/// Receives the output buffer after inference.
pub type MicroportOutputCallback =
    Option<unsafe extern "C" fn(user_data: *mut c_void, data: *const f32, height: u32, width: u32, channels: u32)>;

/// Writes the canonical input shape of `model_data` into `height`, `width`
/// and `channels`.
///
/// # Safety
///
/// `model_data` must point to `model_len` readable bytes and `tensor_arena`
/// to `tensor_arena_size` writable bytes that nothing else touches for the
/// duration of the call. The three out-pointers must be valid for writes.
#[no_mangle]
pub unsafe extern "C" fn microport_get_input_data_hwc(
    model_data: *const u8,
    model_len: usize,
    tensor_arena: *mut u8,
    tensor_arena_size: usize,
    height: *mut u32,
    width: *mut u32,
    channels: *mut u32,
) -> c_int {
    if height.is_null() || width.is_null() || channels.is_null() {
        return null_argument("microport_get_input_data_hwc");
    }
    let (model, arena) = match buffers("microport_get_input_data_hwc", model_data, model_len, tensor_arena, tensor_arena_size) {
        Ok(buffers) => buffers,
        Err(status) => return status,
    };

    guarded("microport_get_input_data_hwc", || {
        let hwc = pipeline()
            .get_input_shape(model, arena)
            .map_err(|err| pipeline_failure("microport_get_input_data_hwc", &err))?;
        write_hwc("microport_get_input_data_hwc", hwc, height, width, channels)
    })
}

/// Writes the canonical output shape of `model_data`. No inference is run.
///
/// # Safety
///
/// Same contract as [`microport_get_input_data_hwc`].
#[no_mangle]
pub unsafe extern "C" fn microport_get_output_data_hwc(
    model_data: *const u8,
    model_len: usize,
    tensor_arena: *mut u8,
    tensor_arena_size: usize,
    height: *mut u32,
    width: *mut u32,
    channels: *mut u32,
) -> c_int {
    if height.is_null() || width.is_null() || channels.is_null() {
        return null_argument("microport_get_output_data_hwc");
    }
    let (model, arena) = match buffers("microport_get_output_data_hwc", model_data, model_len, tensor_arena, tensor_arena_size) {
        Ok(buffers) => buffers,
        Err(status) => return status,
    };

    guarded("microport_get_output_data_hwc", || {
        let hwc = pipeline()
            .get_output_shape(model, arena)
            .map_err(|err| pipeline_failure("microport_get_output_data_hwc", &err))?;
        write_hwc("microport_get_output_data_hwc", hwc, height, width, channels)
    })
}

/// Runs one inference pass. `input_callback` fills the input tensor in
/// place, then `output_callback` reads the result in place. Each callback is
/// called at most once and never after a failure has been detected.
///
/// # Safety
///
/// Same buffer contract as [`microport_get_input_data_hwc`]. The callbacks
/// must not retain the data pointers past their return, and the user-data
/// pointers are passed through untouched.
#[no_mangle]
pub unsafe extern "C" fn microport_invoke(
    model_data: *const u8,
    model_len: usize,
    tensor_arena: *mut u8,
    tensor_arena_size: usize,
    input_callback: MicroportInputCallback,
    input_user_data: *mut c_void,
    output_callback: MicroportOutputCallback,
    output_user_data: *mut c_void,
) -> c_int {
    let (Some(input_callback), Some(output_callback)) = (input_callback, output_callback) else {
        return null_argument("microport_invoke");
    };
    let (model, arena) = match buffers("microport_invoke", model_data, model_len, tensor_arena, tensor_arena_size) {
        Ok(buffers) => buffers,
        Err(status) => return status,
    };

    guarded("microport_invoke", || {
        let overflow = Cell::new(None);
        pipeline()
            .invoke(
                model,
                arena,
                |buf, hwc| match dims_u32(hwc) {
                    Some((h, w, c)) => input_callback(input_user_data, buf.as_mut_ptr(), h, w, c),
                    None => overflow.set(Some(hwc)),
                },
                |buf, hwc| match (overflow.get(), dims_u32(hwc)) {
                    (None, Some((h, w, c))) => output_callback(output_user_data, buf.as_ptr(), h, w, c),
                    (None, None) => overflow.set(Some(hwc)),
                    (Some(_), _) => {}
                },
            )
            .map_err(|err| pipeline_failure("microport_invoke", &err))?;
        match overflow.get() {
            Some(hwc) => Err(dimension_overflow("microport_invoke", hwc)),
            None => Ok(()),
        }
    })
}

/// Borrows the model and arena after checking what `from_raw_parts` needs
/// that can be checked from here.
unsafe fn buffers<'a>(
    op: &'static str,
    model_data: *const u8,
    model_len: usize,
    tensor_arena: *mut u8,
    tensor_arena_size: usize,
) -> Result<(&'a [u8], &'a mut [u8]), c_int> {
    if model_data.is_null() || tensor_arena.is_null() {
        return Err(null_argument(op));
    }
    if model_len > isize::MAX as usize || tensor_arena_size > isize::MAX as usize {
        warn!(op, model_len, tensor_arena_size, "buffer length exceeds isize::MAX");
        return Err(MICROPORT_ERR_LENGTH_OVERFLOW);
    }
    Ok((
        slice::from_raw_parts(model_data, model_len),
        slice::from_raw_parts_mut(tensor_arena, tensor_arena_size),
    ))
}

fn pipeline() -> Pipeline<FlatEngine> {
    Pipeline::new(FlatEngine::new())
}

fn guarded<F>(op: &'static str, f: F) -> c_int
where
    F: FnOnce() -> Result<(), c_int>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => MICROPORT_OK,
        Ok(Err(status)) => status,
        Err(_) => {
            warn!(op, "panic caught at the C boundary");
            MICROPORT_ERR_PANIC
        }
    }
}

fn dims_u32(hwc: Hwc) -> Option<(u32, u32, u32)> {
    Some((
        u32::try_from(hwc.height).ok()?,
        u32::try_from(hwc.width).ok()?,
        u32::try_from(hwc.channels).ok()?,
    ))
}

unsafe fn write_hwc(op: &'static str, hwc: Hwc, height: *mut u32, width: *mut u32, channels: *mut u32) -> Result<(), c_int> {
    let (h, w, c) = dims_u32(hwc).ok_or_else(|| dimension_overflow(op, hwc))?;
    height.write(h);
    width.write(w);
    channels.write(c);
    Ok(())
}

fn pipeline_failure(op: &'static str, err: &PipelineError) -> c_int {
    let code = err.kind().code();
    let mut detail = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        detail.push_str(": ");
        detail.push_str(&cause.to_string());
        source = cause.source();
    }
    warn!(op, code, stage = %err.stage(), error = %detail, "call failed");
    code
}

fn dimension_overflow(op: &'static str, hwc: Hwc) -> c_int {
    warn!(op, %hwc, "canonical shape does not fit in u32");
    MICROPORT_ERR_DIMENSION_OVERFLOW
}

fn null_argument(op: &'static str) -> c_int {
    warn!(op, "null argument");
    MICROPORT_ERR_NULL_ARGUMENT
}
