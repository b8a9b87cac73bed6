//! Minimal PKCS#11 binding.
//!
//! Only the handful of entry points the signing core needs are bound, and
//! the module is loaded at runtime from the configured library path so the
//! crate builds and runs without any HSM present. All `unsafe` lives here;
//! callers see fallible safe wrappers returning raw `CK_RV` codes.

#![allow(non_snake_case)]

use libloading::Library;
use std::os::raw::{c_ulong, c_void};

pub type CkUlong = c_ulong;
pub type CkRv = CkUlong;
pub type CkSlotId = CkUlong;
pub type CkSessionHandle = CkUlong;
pub type CkObjectHandle = CkUlong;

pub const CKR_OK: CkRv = 0x0000;
pub const CKR_GENERAL_ERROR: CkRv = 0x0005;
pub const CKR_ARGUMENTS_BAD: CkRv = 0x0007;
pub const CKR_DEVICE_ERROR: CkRv = 0x0030;
pub const CKR_PIN_INCORRECT: CkRv = 0x00A0;
pub const CKR_SIGNATURE_INVALID: CkRv = 0x00C0;

pub const CKF_SERIAL_SESSION: CkUlong = 0x0004;
pub const CKU_USER: CkUlong = 1;

pub const CKO_CERTIFICATE: CkUlong = 0x0001;
pub const CKO_PUBLIC_KEY: CkUlong = 0x0002;
pub const CKO_PRIVATE_KEY: CkUlong = 0x0003;

pub const CKA_CLASS: CkUlong = 0x0000;
pub const CKA_LABEL: CkUlong = 0x0003;
pub const CKA_VALUE: CkUlong = 0x0011;

pub const CKM_RSA_PKCS: CkUlong = 0x0001;
pub const CKM_SHA256_RSA_PKCS: CkUlong = 0x0040;

#[repr(C)]
struct CkAttribute {
    attr_type: CkUlong,
    value: *mut c_void,
    value_len: CkUlong,
}

#[repr(C)]
struct CkMechanism {
    mechanism: CkUlong,
    parameter: *mut c_void,
    parameter_len: CkUlong,
}

type FnInitialize = unsafe extern "C" fn(*mut c_void) -> CkRv;
type FnFinalize = unsafe extern "C" fn(*mut c_void) -> CkRv;
type FnGetSlotList = unsafe extern "C" fn(u8, *mut CkSlotId, *mut CkUlong) -> CkRv;
type FnOpenSession = unsafe extern "C" fn(
    CkSlotId,
    CkUlong,
    *mut c_void,
    *mut c_void,
    *mut CkSessionHandle,
) -> CkRv;
type FnCloseSession = unsafe extern "C" fn(CkSessionHandle) -> CkRv;
type FnLogin = unsafe extern "C" fn(CkSessionHandle, CkUlong, *const u8, CkUlong) -> CkRv;
type FnLogout = unsafe extern "C" fn(CkSessionHandle) -> CkRv;
type FnFindObjectsInit =
    unsafe extern "C" fn(CkSessionHandle, *const CkAttribute, CkUlong) -> CkRv;
type FnFindObjects =
    unsafe extern "C" fn(CkSessionHandle, *mut CkObjectHandle, CkUlong, *mut CkUlong) -> CkRv;
type FnFindObjectsFinal = unsafe extern "C" fn(CkSessionHandle) -> CkRv;
type FnSignInit =
    unsafe extern "C" fn(CkSessionHandle, *const CkMechanism, CkObjectHandle) -> CkRv;
type FnSign = unsafe extern "C" fn(
    CkSessionHandle,
    *const u8,
    CkUlong,
    *mut u8,
    *mut CkUlong,
) -> CkRv;
type FnVerifyInit =
    unsafe extern "C" fn(CkSessionHandle, *const CkMechanism, CkObjectHandle) -> CkRv;
type FnVerify =
    unsafe extern "C" fn(CkSessionHandle, *const u8, CkUlong, *const u8, CkUlong) -> CkRv;
type FnGetAttributeValue =
    unsafe extern "C" fn(CkSessionHandle, CkObjectHandle, *mut CkAttribute, CkUlong) -> CkRv;

/// A loaded PKCS#11 module. Function pointers stay valid for as long as
/// the `Library` they came from, which this struct owns.
pub struct Pkcs11Module {
    _lib: Library,
    initialize: FnInitialize,
    finalize: FnFinalize,
    get_slot_list: FnGetSlotList,
    open_session: FnOpenSession,
    close_session: FnCloseSession,
    login: FnLogin,
    logout: FnLogout,
    find_objects_init: FnFindObjectsInit,
    find_objects: FnFindObjects,
    find_objects_final: FnFindObjectsFinal,
    sign_init: FnSignInit,
    sign: FnSign,
    verify_init: FnVerifyInit,
    verify: FnVerify,
    get_attribute_value: FnGetAttributeValue,
}

impl Pkcs11Module {
    /// Load the module at `path` and call `C_Initialize`. Any failure
    /// (missing file, missing symbol, init error) is returned as a message;
    /// the caller decides whether to fall back.
    pub fn load(path: &str) -> Result<Self, String> {
        unsafe {
            let lib = Library::new(path).map_err(|e| format!("cannot load {}: {}", path, e))?;

            macro_rules! sym {
                ($name:literal, $ty:ty) => {
                    *lib.get::<$ty>($name)
                        .map_err(|e| format!("missing symbol {}: {}", String::from_utf8_lossy($name), e))?
                };
            }

            let module = Self {
                initialize: sym!(b"C_Initialize", FnInitialize),
                finalize: sym!(b"C_Finalize", FnFinalize),
                get_slot_list: sym!(b"C_GetSlotList", FnGetSlotList),
                open_session: sym!(b"C_OpenSession", FnOpenSession),
                close_session: sym!(b"C_CloseSession", FnCloseSession),
                login: sym!(b"C_Login", FnLogin),
                logout: sym!(b"C_Logout", FnLogout),
                find_objects_init: sym!(b"C_FindObjectsInit", FnFindObjectsInit),
                find_objects: sym!(b"C_FindObjects", FnFindObjects),
                find_objects_final: sym!(b"C_FindObjectsFinal", FnFindObjectsFinal),
                sign_init: sym!(b"C_SignInit", FnSignInit),
                sign: sym!(b"C_Sign", FnSign),
                verify_init: sym!(b"C_VerifyInit", FnVerifyInit),
                verify: sym!(b"C_Verify", FnVerify),
                get_attribute_value: sym!(b"C_GetAttributeValue", FnGetAttributeValue),
                _lib: lib,
            };

            let rv = (module.initialize)(std::ptr::null_mut());
            if rv != CKR_OK {
                return Err(format!("C_Initialize failed: 0x{:X}", rv));
            }

            Ok(module)
        }
    }

    /// Slots with a token present.
    pub fn slot_list(&self) -> Result<Vec<CkSlotId>, CkRv> {
        unsafe {
            let mut count: CkUlong = 0;
            let rv = (self.get_slot_list)(1, std::ptr::null_mut(), &mut count);
            if rv != CKR_OK {
                return Err(rv);
            }
            if count == 0 {
                return Ok(Vec::new());
            }
            let mut slots = vec![0 as CkSlotId; count as usize];
            let rv = (self.get_slot_list)(1, slots.as_mut_ptr(), &mut count);
            if rv != CKR_OK {
                return Err(rv);
            }
            slots.truncate(count as usize);
            Ok(slots)
        }
    }

    pub fn open_session(&self, slot: CkSlotId) -> Result<CkSessionHandle, CkRv> {
        unsafe {
            let mut handle: CkSessionHandle = 0;
            let rv = (self.open_session)(
                slot,
                CKF_SERIAL_SESSION,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                &mut handle,
            );
            if rv != CKR_OK {
                return Err(rv);
            }
            Ok(handle)
        }
    }

    pub fn close_session(&self, session: CkSessionHandle) {
        unsafe {
            (self.close_session)(session);
        }
    }

    pub fn login_user(&self, session: CkSessionHandle, pin: &str) -> Result<(), CkRv> {
        unsafe {
            let rv = (self.login)(session, CKU_USER, pin.as_ptr(), pin.len() as CkUlong);
            if rv == CKR_OK {
                Ok(())
            } else {
                Err(rv)
            }
        }
    }

    pub fn logout(&self, session: CkSessionHandle) {
        unsafe {
            (self.logout)(session);
        }
    }

    /// First object of `class` whose `CKA_LABEL` equals `label`.
    pub fn find_object(
        &self,
        session: CkSessionHandle,
        class: CkUlong,
        label: &str,
    ) -> Option<CkObjectHandle> {
        unsafe {
            let mut class_val = class;
            let template = [
                CkAttribute {
                    attr_type: CKA_CLASS,
                    value: &mut class_val as *mut CkUlong as *mut c_void,
                    value_len: std::mem::size_of::<CkUlong>() as CkUlong,
                },
                CkAttribute {
                    attr_type: CKA_LABEL,
                    value: label.as_ptr() as *mut c_void,
                    value_len: label.len() as CkUlong,
                },
            ];

            if (self.find_objects_init)(session, template.as_ptr(), 2) != CKR_OK {
                return None;
            }
            let mut handle: CkObjectHandle = 0;
            let mut found: CkUlong = 0;
            let rv = (self.find_objects)(session, &mut handle, 1, &mut found);
            (self.find_objects_final)(session);
            if rv == CKR_OK && found == 1 {
                Some(handle)
            } else {
                None
            }
        }
    }

    /// Fetch a variable-length attribute (two-call pattern).
    pub fn get_attribute(
        &self,
        session: CkSessionHandle,
        object: CkObjectHandle,
        attr_type: CkUlong,
    ) -> Option<Vec<u8>> {
        unsafe {
            let mut attr = CkAttribute {
                attr_type,
                value: std::ptr::null_mut(),
                value_len: 0,
            };
            if (self.get_attribute_value)(session, object, &mut attr, 1) != CKR_OK
                || attr.value_len == 0
            {
                return None;
            }
            let mut buf = vec![0u8; attr.value_len as usize];
            attr.value = buf.as_mut_ptr() as *mut c_void;
            if (self.get_attribute_value)(session, object, &mut attr, 1) != CKR_OK {
                return None;
            }
            buf.truncate(attr.value_len as usize);
            Some(buf)
        }
    }

    pub fn sign(
        &self,
        session: CkSessionHandle,
        mechanism: CkUlong,
        key: CkObjectHandle,
        data: &[u8],
    ) -> Result<Vec<u8>, CkRv> {
        unsafe {
            let mech = CkMechanism {
                mechanism,
                parameter: std::ptr::null_mut(),
                parameter_len: 0,
            };
            let rv = (self.sign_init)(session, &mech, key);
            if rv != CKR_OK {
                return Err(rv);
            }
            let mut sig_len: CkUlong = 4096;
            let mut sig = vec![0u8; sig_len as usize];
            let rv = (self.sign)(
                session,
                data.as_ptr(),
                data.len() as CkUlong,
                sig.as_mut_ptr(),
                &mut sig_len,
            );
            if rv != CKR_OK {
                return Err(rv);
            }
            sig.truncate(sig_len as usize);
            Ok(sig)
        }
    }

    pub fn verify(
        &self,
        session: CkSessionHandle,
        mechanism: CkUlong,
        key: CkObjectHandle,
        data: &[u8],
        signature: &[u8],
    ) -> Result<(), CkRv> {
        unsafe {
            let mech = CkMechanism {
                mechanism,
                parameter: std::ptr::null_mut(),
                parameter_len: 0,
            };
            let rv = (self.verify_init)(session, &mech, key);
            if rv != CKR_OK {
                return Err(rv);
            }
            let rv = (self.verify)(
                session,
                data.as_ptr(),
                data.len() as CkUlong,
                signature.as_ptr(),
                signature.len() as CkUlong,
            );
            if rv == CKR_OK {
                Ok(())
            } else {
                Err(rv)
            }
        }
    }

    pub fn finalize_module(&self) {
        unsafe {
            (self.finalize)(std::ptr::null_mut());
        }
    }
}
