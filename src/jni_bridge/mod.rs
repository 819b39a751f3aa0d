//! JNI entry points for `sfdroid.Helpers`
//!
//! The system service calls the two natives whenever an application
//! component starts or closes. Both forward to one process-wide
//! [`SharedClient`], and neither ever throws into Java: delivery is best
//! effort and failures only reach the log.

use jni::objects::{JObject, JString};
use jni::sys::{jint, JNI_ERR, JNI_VERSION_1_6};
use jni::{JNIEnv, JavaVM, NativeMethod};
use std::ffi::c_void;
use std::sync::{Once, OnceLock};

use crate::config::Config;
use crate::notify::{NotificationClient, NotifyKind, SharedClient, UnixConnector};

/// Java class the natives are registered on
pub const HELPERS_CLASS: &str = "sfdroid/Helpers";

/// logcat tag
pub const LOG_TAG: &str = "sfdroid_Helpers";

const NOTIFY_SIGNATURE: &str = "(Ljava/lang/String;)V";

static CLIENT: OnceLock<SharedClient<UnixConnector>> = OnceLock::new();

fn client() -> &'static SharedClient<UnixConnector> {
    CLIENT.get_or_init(|| SharedClient::new(NotificationClient::from_config(&Config::default())))
}

/// Route `tracing` output to logcat (or stderr off-device)
pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        #[cfg(target_os = "android")]
        android_logger::init_once(
            android_logger::Config::default()
                .with_max_level(log::LevelFilter::Info)
                .with_tag(LOG_TAG),
        );

        #[cfg(not(target_os = "android"))]
        {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .try_init();
        }
    });
}

/// Register the natives on [`HELPERS_CLASS`]
///
/// Called from [`register_sfdroid_Helpers`] by the runtime's registration
/// table, or from [`JNI_OnLoad`] when the library is loaded with
/// `System.loadLibrary`.
pub fn register_natives(env: &mut JNIEnv) -> jni::errors::Result<()> {
    let methods = [
        NativeMethod {
            name: "notify_of_app_start".into(),
            sig: NOTIFY_SIGNATURE.into(),
            fn_ptr: notify_of_app_start as *mut c_void,
        },
        NativeMethod {
            name: "notify_of_app_close".into(),
            sig: NOTIFY_SIGNATURE.into(),
            fn_ptr: notify_of_app_close as *mut c_void,
        },
    ];
    env.register_native_methods(HELPERS_CLASS, &methods)
}

/// C entry point for the Android runtime's registration table
///
/// Returns 0 on success and a negative value on failure, like
/// `jniRegisterNativeMethods`.
#[no_mangle]
#[allow(non_snake_case)]
pub extern "system" fn register_sfdroid_Helpers(env: *mut jni::sys::JNIEnv) -> jint {
    init_logging();

    // SAFETY: the runtime passes the JNIEnv of the calling, attached thread
    let mut env = match unsafe { JNIEnv::from_raw(env) } {
        Ok(env) => env,
        Err(e) => {
            tracing::error!("Invalid JNIEnv: {}", e);
            return JNI_ERR;
        }
    };

    match register_natives(&mut env) {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!("Failed to register {} natives: {}", HELPERS_CLASS, e);
            JNI_ERR
        }
    }
}

#[no_mangle]
pub extern "system" fn JNI_OnLoad(vm: JavaVM, _reserved: *mut c_void) -> jint {
    init_logging();

    let mut env = match vm.get_env() {
        Ok(env) => env,
        Err(e) => {
            tracing::error!("Failed to get JNIEnv: {}", e);
            return JNI_ERR;
        }
    };

    if let Err(e) = register_natives(&mut env) {
        tracing::error!("Failed to register {} natives: {}", HELPERS_CLASS, e);
        return JNI_ERR;
    }

    JNI_VERSION_1_6
}

extern "system" fn notify_of_app_start<'local>(
    mut env: JNIEnv<'local>,
    _this: JObject<'local>,
    component: JString<'local>,
) {
    let component = component_name(&mut env, &component);
    dispatch(client(), NotifyKind::Start, component.as_deref());
}

extern "system" fn notify_of_app_close<'local>(
    mut env: JNIEnv<'local>,
    _this: JObject<'local>,
    component: JString<'local>,
) {
    let component = component_name(&mut env, &component);
    dispatch(client(), NotifyKind::Close, component.as_deref());
}

/// Copy the Java string out; the JVM copy is released on return
fn component_name(env: &mut JNIEnv, component: &JString) -> Option<String> {
    if component.is_null() {
        return None;
    }
    match env.get_string(component) {
        Ok(s) => Some(s.into()),
        Err(e) => {
            tracing::error!("Failed to read component name: {}", e);
            None
        }
    }
}

fn dispatch(client: &SharedClient<UnixConnector>, kind: NotifyKind, component: Option<&str>) {
    let Some(component) = component else {
        tracing::error!("component is NULL");
        return;
    };
    // failures are already logged by the client
    let _ = client.notify(kind, component);
}
