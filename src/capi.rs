//! C-callable shim over the engine: opaque pointers in, status codes and
//! addresses out. Pure marshaling, no logic of its own.
//!
//! Null engine/handle/module pointers fail the call instead of crashing.
//! Everything else follows the Rust API's contract: pointers must originate
//! from this shim (modules are built with the Rust [`crate::ir`] API and
//! boxed by the binding layer), and each dispose function must be called at
//! most once per pointer. Using a pointer after its dispose call is
//! undefined, exactly as with any C library.

use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::ptr;

use log::error;

use crate::ir::IrModule;
use crate::jit::{JitEngine, ModuleHandle};
use crate::target::TargetDescriptor;

/// Create an engine for the host target. Returns null when the environment
/// has no usable target; that failure is fatal in the Rust API and maps to a
/// null here.
#[no_mangle]
pub extern "C" fn narwhal_jit_new() -> *mut JitEngine {
    match JitEngine::new() {
        Ok(engine) => Box::into_raw(Box::new(engine)),
        Err(err) => {
            error!("engine construction failed: {err}");
            ptr::null_mut()
        }
    }
}

/// Tear the engine down, releasing every loaded module's executable memory.
#[no_mangle]
pub unsafe extern "C" fn narwhal_jit_dispose(jit: *mut JitEngine) {
    if !jit.is_null() {
        drop(Box::from_raw(jit));
    }
}

/// Borrow the engine's target description; valid while the engine lives.
#[no_mangle]
pub unsafe extern "C" fn narwhal_jit_target(jit: *const JitEngine) -> *const TargetDescriptor {
    match jit.as_ref() {
        Some(engine) => engine.target() as *const TargetDescriptor,
        None => ptr::null(),
    }
}

/// The target triple as a heap string; release with
/// [`narwhal_string_dispose`].
#[no_mangle]
pub unsafe extern "C" fn narwhal_target_triple(target: *const TargetDescriptor) -> *mut c_char {
    let Some(target) = target.as_ref() else {
        return ptr::null_mut();
    };
    match CString::new(target.triple().to_string()) {
        Ok(triple) => triple.into_raw(),
        Err(_) => ptr::null_mut(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn narwhal_string_dispose(string: *mut c_char) {
    if !string.is_null() {
        drop(CString::from_raw(string));
    }
}

/// Submit `**module`, transferring ownership: the caller's pointer is nulled
/// out and the module is consumed whether or not compilation succeeds.
/// Returns a heap-boxed handle (release with [`narwhal_handle_dispose`]), or
/// null on failure.
#[no_mangle]
pub unsafe extern "C" fn narwhal_jit_add_module(
    jit: *mut JitEngine,
    module: *mut *mut IrModule,
) -> *mut ModuleHandle {
    let Some(engine) = jit.as_mut() else {
        return ptr::null_mut();
    };
    let Some(slot) = module.as_mut() else {
        return ptr::null_mut();
    };
    if slot.is_null() {
        return ptr::null_mut();
    }

    let module = *Box::from_raw(*slot);
    *slot = ptr::null_mut();

    match engine.add_module(module) {
        Ok(handle) => Box::into_raw(Box::new(handle)),
        Err(err) => {
            error!("module submission failed: {err}");
            ptr::null_mut()
        }
    }
}

/// Remove a module. Returns 0 on success, -1 for a null argument or an
/// unknown/already-removed handle. The handle box itself is still released
/// with [`narwhal_handle_dispose`].
#[no_mangle]
pub unsafe extern "C" fn narwhal_jit_remove_module(
    jit: *mut JitEngine,
    handle: *const ModuleHandle,
) -> c_int {
    let (Some(engine), Some(handle)) = (jit.as_mut(), handle.as_ref()) else {
        return -1;
    };
    match engine.remove_module(*handle) {
        Ok(()) => 0,
        Err(err) => {
            error!("module removal failed: {err}");
            -1
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn narwhal_handle_dispose(handle: *mut ModuleHandle) {
    if !handle.is_null() {
        drop(Box::from_raw(handle));
    }
}

/// Release a module that will never be submitted.
#[no_mangle]
pub unsafe extern "C" fn narwhal_module_dispose(module: *mut IrModule) {
    if !module.is_null() {
        drop(Box::from_raw(module));
    }
}

/// Resolve a name to an address, or null when nothing defines it (a normal
/// miss and invalid input look the same here; the Rust API distinguishes
/// them).
#[no_mangle]
pub unsafe extern "C" fn narwhal_jit_find_symbol(
    jit: *const JitEngine,
    name: *const c_char,
) -> *const c_void {
    let Some(engine) = jit.as_ref() else {
        return ptr::null();
    };
    if name.is_null() {
        return ptr::null();
    }
    let Ok(name) = CStr::from_ptr(name).to_str() else {
        return ptr::null();
    };

    match engine.find_symbol(name) {
        Some(symbol) => symbol.address as *const c_void,
        None => ptr::null(),
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::CString;

    use super::*;
    use crate::ir::{Expr, FuncDef};

    fn boxed_module() -> *mut IrModule {
        let module = IrModule::new("capi")
            .with_function(FuncDef::exported("nine", 0, Expr::Const(9)));
        Box::into_raw(Box::new(module))
    }

    #[test]
    fn lifecycle_through_the_shim() {
        let jit = narwhal_jit_new();
        assert!(!jit.is_null());

        let mut module = boxed_module();
        let handle = unsafe { narwhal_jit_add_module(jit, &mut module) };
        assert!(module.is_null());
        assert!(!handle.is_null());

        let name = CString::new("nine").unwrap();
        let address = unsafe { narwhal_jit_find_symbol(jit, name.as_ptr()) };
        assert!(!address.is_null());
        let nine: unsafe extern "C" fn() -> i64 = unsafe { std::mem::transmute(address) };
        assert_eq!(unsafe { nine() }, 9);

        assert_eq!(unsafe { narwhal_jit_remove_module(jit, handle) }, 0);
        assert!(unsafe { narwhal_jit_find_symbol(jit, name.as_ptr()) }.is_null());
        assert_eq!(unsafe { narwhal_jit_remove_module(jit, handle) }, -1);
        unsafe { narwhal_handle_dispose(handle) };

        let triple = unsafe { narwhal_target_triple(narwhal_jit_target(jit)) };
        assert!(!triple.is_null());
        unsafe { narwhal_string_dispose(triple) };

        unsafe { narwhal_jit_dispose(jit) };
    }

    #[test]
    fn null_arguments_fail_the_call() {
        assert!(unsafe { narwhal_jit_target(ptr::null()) }.is_null());
        assert_eq!(
            unsafe { narwhal_jit_remove_module(ptr::null_mut(), ptr::null()) },
            -1
        );

        // A null engine must not consume the caller's module.
        let mut module = boxed_module();
        assert!(unsafe { narwhal_jit_add_module(ptr::null_mut(), &mut module) }.is_null());
        assert!(!module.is_null());
        unsafe { narwhal_module_dispose(module) };
    }
}
