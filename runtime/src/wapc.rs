//! waPC guest execution using Wasmtime.
//!
//! Chaincode compiled to wasm talks to its host through the waPC calling
//! convention. The host calls the guest export `__guard_call(op_len,
//! msg_len)`; the guest pulls the operation name and payload with
//! `__guest_request` and answers through `__guest_response` or
//! `__guest_error`. While running, the guest reaches the host with
//! `__host_call(binding, namespace, operation, payload)` and fetches the
//! reply with `__host_response_len`/`__host_response` or the failure with
//! `__host_error_len`/`__host_error`. All imports live in module `"wapc"`.
//!
//! A [`WapcModule`] compiles the module bytes once. Each [`WapcInstance`] is
//! one Wasmtime store and instance created from it, so instances share code
//! but not memory.

use std::sync::Arc;

use tracing::{debug, info};
use wasmtime::{Caller, Config, Engine, Extern, Instance, Linker, Memory, Module, Store, TypedFunc};

use crate::error::ExecutorError;
use crate::executor::{ExecutorFactory, GuestExecutor, HostCallHandler};

/// Import module name of the waPC host functions.
pub const WAPC_MODULE: &str = "wapc";

/// Guest export that services one call.
pub const GUARD_CALL: &str = "__guard_call";

/// Optional guest exports run once after instantiation, in this order.
const INIT_EXPORTS: [&str; 2] = ["_start", "wapc_init"];

/// State held by the Wasmtime store for each instance.
///
/// Buffers belong to the call in progress and are reset before each one.
pub struct WapcState {
    host: Arc<dyn HostCallHandler>,
    guest_operation: Vec<u8>,
    guest_request: Vec<u8>,
    guest_response: Option<Vec<u8>>,
    guest_error: Option<String>,
    host_response: Option<Vec<u8>>,
    host_error: Option<String>,
}

impl WapcState {
    fn new(host: Arc<dyn HostCallHandler>) -> Self {
        Self {
            host,
            guest_operation: Vec::new(),
            guest_request: Vec::new(),
            guest_response: None,
            guest_error: None,
            host_response: None,
            host_error: None,
        }
    }

    fn begin(&mut self, operation: &str, payload: &[u8]) {
        self.guest_operation = operation.as_bytes().to_vec();
        self.guest_request = payload.to_vec();
        self.guest_response = None;
        self.guest_error = None;
        self.host_response = None;
        self.host_error = None;
    }
}

fn guest_memory(caller: &mut Caller<'_, WapcState>) -> wasmtime::Result<Memory> {
    caller
        .get_export("memory")
        .and_then(Extern::into_memory)
        .ok_or_else(|| wasmtime::Error::msg("guest module does not export memory"))
}

fn offset(value: i32) -> wasmtime::Result<usize> {
    usize::try_from(value)
        .map_err(|_| wasmtime::Error::msg(format!("negative guest pointer or length: {}", value)))
}

fn read_guest(caller: &mut Caller<'_, WapcState>, ptr: i32, len: i32) -> wasmtime::Result<Vec<u8>> {
    let memory = guest_memory(caller)?;
    let start = offset(ptr)?;
    let end = start.checked_add(offset(len)?);
    // Bounds are checked against the guest's memory before anything is
    // allocated for the copy.
    end.and_then(|end| memory.data(&*caller).get(start..end))
        .map(<[u8]>::to_vec)
        .ok_or_else(|| wasmtime::Error::msg(format!("guest range {}+{} out of bounds", ptr, len)))
}

fn read_guest_string(
    caller: &mut Caller<'_, WapcState>,
    ptr: i32,
    len: i32,
) -> wasmtime::Result<String> {
    let bytes = read_guest(caller, ptr, len)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn write_guest(caller: &mut Caller<'_, WapcState>, ptr: i32, data: &[u8]) -> wasmtime::Result<()> {
    let memory = guest_memory(caller)?;
    memory.write(&mut *caller, offset(ptr)?, data)?;
    Ok(())
}

fn len_i32(len: usize) -> wasmtime::Result<i32> {
    i32::try_from(len).map_err(|_| wasmtime::Error::msg("buffer too large for guest"))
}

/// Define the waPC host functions on a linker.
fn add_to_linker(linker: &mut Linker<WapcState>) -> wasmtime::Result<()> {
    linker.func_wrap(
        WAPC_MODULE,
        "__guest_request",
        |mut caller: Caller<'_, WapcState>, op_ptr: i32, ptr: i32| -> wasmtime::Result<()> {
            let operation = caller.data().guest_operation.clone();
            let request = caller.data().guest_request.clone();
            write_guest(&mut caller, op_ptr, &operation)?;
            write_guest(&mut caller, ptr, &request)
        },
    )?;

    linker.func_wrap(
        WAPC_MODULE,
        "__guest_response",
        |mut caller: Caller<'_, WapcState>, ptr: i32, len: i32| -> wasmtime::Result<()> {
            let response = read_guest(&mut caller, ptr, len)?;
            caller.data_mut().guest_response = Some(response);
            Ok(())
        },
    )?;

    linker.func_wrap(
        WAPC_MODULE,
        "__guest_error",
        |mut caller: Caller<'_, WapcState>, ptr: i32, len: i32| -> wasmtime::Result<()> {
            let message = read_guest_string(&mut caller, ptr, len)?;
            caller.data_mut().guest_error = Some(message);
            Ok(())
        },
    )?;

    linker.func_wrap(
        WAPC_MODULE,
        "__host_call",
        |mut caller: Caller<'_, WapcState>,
         bd_ptr: i32,
         bd_len: i32,
         ns_ptr: i32,
         ns_len: i32,
         op_ptr: i32,
         op_len: i32,
         ptr: i32,
         len: i32|
         -> wasmtime::Result<i32> {
            let binding = read_guest_string(&mut caller, bd_ptr, bd_len)?;
            let namespace = read_guest_string(&mut caller, ns_ptr, ns_len)?;
            let operation = read_guest_string(&mut caller, op_ptr, op_len)?;
            let payload = read_guest(&mut caller, ptr, len)?;

            let host = Arc::clone(&caller.data().host);
            let result = host.host_call(&binding, &namespace, &operation, &payload);

            let state = caller.data_mut();
            state.host_response = None;
            state.host_error = None;
            match result {
                Ok(response) => {
                    state.host_response = Some(response);
                    Ok(1)
                }
                Err(message) => {
                    debug!(%binding, %namespace, %operation, error = %message, "host call failed");
                    state.host_error = Some(message);
                    Ok(0)
                }
            }
        },
    )?;

    linker.func_wrap(
        WAPC_MODULE,
        "__host_response_len",
        |caller: Caller<'_, WapcState>| -> wasmtime::Result<i32> {
            len_i32(caller.data().host_response.as_ref().map_or(0, Vec::len))
        },
    )?;

    linker.func_wrap(
        WAPC_MODULE,
        "__host_response",
        |mut caller: Caller<'_, WapcState>, ptr: i32| -> wasmtime::Result<()> {
            match caller.data().host_response.clone() {
                Some(response) => write_guest(&mut caller, ptr, &response),
                None => Ok(()),
            }
        },
    )?;

    linker.func_wrap(
        WAPC_MODULE,
        "__host_error_len",
        |caller: Caller<'_, WapcState>| -> wasmtime::Result<i32> {
            len_i32(caller.data().host_error.as_ref().map_or(0, String::len))
        },
    )?;

    linker.func_wrap(
        WAPC_MODULE,
        "__host_error",
        |mut caller: Caller<'_, WapcState>, ptr: i32| -> wasmtime::Result<()> {
            match caller.data().host_error.clone() {
                Some(message) => write_guest(&mut caller, ptr, message.as_bytes()),
                None => Ok(()),
            }
        },
    )?;

    linker.func_wrap(
        WAPC_MODULE,
        "__console_log",
        |mut caller: Caller<'_, WapcState>, ptr: i32, len: i32| -> wasmtime::Result<()> {
            let message = read_guest_string(&mut caller, ptr, len)?;
            info!(target: "wasmcc::guest", "{}", message);
            Ok(())
        },
    )?;

    Ok(())
}

/// A compiled waPC module and the factory for its instances.
pub struct WapcModule {
    engine: Engine,
    module: Module,
    linker: Linker<WapcState>,
    host: Arc<dyn HostCallHandler>,
}

impl WapcModule {
    /// Compile module bytes; host calls from its instances go to `host`.
    ///
    /// Both binary wasm and the text format are accepted.
    pub fn new(bytes: &[u8], host: Arc<dyn HostCallHandler>) -> Result<Self, ExecutorError> {
        let config = Config::new();
        let engine = Engine::new(&config).map_err(|e| ExecutorError::Module(e.to_string()))?;

        let module =
            Module::new(&engine, bytes).map_err(|e| ExecutorError::Module(e.to_string()))?;

        let mut linker = Linker::new(&engine);
        add_to_linker(&mut linker).map_err(|e| ExecutorError::Module(e.to_string()))?;
        // Imports outside the waPC ABI (WASI and the like) link, but trap if
        // the guest ever calls them.
        linker
            .define_unknown_imports_as_traps(&module)
            .map_err(|e| ExecutorError::Module(e.to_string()))?;

        Ok(Self {
            engine,
            module,
            linker,
            host,
        })
    }

    /// Load and compile a module from a file.
    pub fn from_file(
        path: impl AsRef<std::path::Path>,
        host: Arc<dyn HostCallHandler>,
    ) -> Result<Self, ExecutorError> {
        let bytes = std::fs::read(path)?;
        Self::new(&bytes, host)
    }

    /// Create a new instance.
    pub fn instantiate(&self) -> Result<WapcInstance, ExecutorError> {
        let mut store = Store::new(&self.engine, WapcState::new(Arc::clone(&self.host)));

        let instance = self
            .linker
            .instantiate(&mut store, &self.module)
            .map_err(|e| ExecutorError::Instantiate(e.to_string()))?;

        let guard_call = instance
            .get_typed_func::<(i32, i32), i32>(&mut store, GUARD_CALL)
            .map_err(|e| ExecutorError::Instantiate(e.to_string()))?;

        run_init_exports(&instance, &mut store)?;

        Ok(WapcInstance { store, guard_call })
    }
}

fn run_init_exports(
    instance: &Instance,
    store: &mut Store<WapcState>,
) -> Result<(), ExecutorError> {
    for name in INIT_EXPORTS {
        let Some(func) = instance.get_func(&mut *store, name) else {
            continue;
        };
        debug!(export = name, "running guest initializer");
        func.typed::<(), ()>(&*store)
            .and_then(|init| init.call(&mut *store, ()))
            .map_err(|e| ExecutorError::Instantiate(format!("{}: {}", name, e)))?;
    }
    Ok(())
}

impl ExecutorFactory for WapcModule {
    type Executor = WapcInstance;

    fn create(&self) -> Result<WapcInstance, ExecutorError> {
        self.instantiate()
    }
}

/// One instantiated waPC guest.
pub struct WapcInstance {
    store: Store<WapcState>,
    guard_call: TypedFunc<(i32, i32), i32>,
}

impl GuestExecutor for WapcInstance {
    fn invoke(&mut self, operation: &str, payload: &[u8]) -> Result<Vec<u8>, ExecutorError> {
        let op_len = i32::try_from(operation.len())
            .map_err(|_| ExecutorError::Guest("operation name too long".to_string()))?;
        let msg_len = i32::try_from(payload.len())
            .map_err(|_| ExecutorError::Guest("payload too large".to_string()))?;

        self.store.data_mut().begin(operation, payload);

        debug!(operation, payload_len = payload.len(), "invoking guest");
        let success = self
            .guard_call
            .call(&mut self.store, (op_len, msg_len))
            .map_err(|e| ExecutorError::Trap(format!("{:?}", e)))?;

        let state = self.store.data_mut();
        if success == 1 {
            Ok(state.guest_response.take().unwrap_or_default())
        } else {
            Err(ExecutorError::Guest(
                state
                    .guest_error
                    .take()
                    .unwrap_or_else(|| "guest call failed".to_string()),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    const ECHO_GUEST: &str = include_str!("../tests/fixtures/echo_guest.wat");

    type Call = (String, String, String, Vec<u8>);

    /// Host that records calls and answers with a fixed reply.
    struct RecordingHost {
        calls: Mutex<Vec<Call>>,
        reply: Result<Vec<u8>, String>,
    }

    impl RecordingHost {
        fn replying(reply: Result<Vec<u8>, String>) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                reply,
            })
        }
    }

    impl HostCallHandler for RecordingHost {
        fn host_call(
            &self,
            binding: &str,
            namespace: &str,
            operation: &str,
            payload: &[u8],
        ) -> Result<Vec<u8>, String> {
            self.calls.lock().unwrap().push((
                binding.to_string(),
                namespace.to_string(),
                operation.to_string(),
                payload.to_vec(),
            ));
            self.reply.clone()
        }
    }

    fn echo_instance(host: Arc<RecordingHost>) -> WapcInstance {
        WapcModule::new(ECHO_GUEST.as_bytes(), host)
            .unwrap()
            .instantiate()
            .unwrap()
    }

    #[test]
    fn echo() {
        let mut instance = echo_instance(RecordingHost::replying(Ok(Vec::new())));
        assert_eq!(instance.invoke("Echo", b"bond").unwrap(), b"bond".to_vec());
    }

    #[test]
    fn buffers_reset_between_calls() {
        let mut instance = echo_instance(RecordingHost::replying(Ok(Vec::new())));
        assert_eq!(
            instance.invoke("Echo", b"goldfinger").unwrap(),
            b"goldfinger".to_vec()
        );
        assert_eq!(instance.invoke("Echo", b"no").unwrap(), b"no".to_vec());
        assert_eq!(instance.invoke("Echo", b"").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn console_log_then_echo() {
        let mut instance = echo_instance(RecordingHost::replying(Ok(Vec::new())));
        assert_eq!(instance.invoke("Log", b"hello").unwrap(), b"hello".to_vec());
    }

    #[test]
    fn guest_error_is_reported() {
        let mut instance = echo_instance(RecordingHost::replying(Ok(Vec::new())));
        let err = instance.invoke("Nope", b"").unwrap_err();
        assert!(matches!(err, ExecutorError::Guest(ref m) if m == "unknown operation"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn trap_is_fatal() {
        let mut instance = echo_instance(RecordingHost::replying(Ok(Vec::new())));
        let err = instance.invoke("Trap", b"").unwrap_err();
        assert!(matches!(err, ExecutorError::Trap(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn host_call_is_forwarded() {
        let host = RecordingHost::replying(Ok(b"pong".to_vec()));
        let mut instance = echo_instance(Arc::clone(&host));

        let response = instance.invoke("HExistsState", b"ping").unwrap();
        assert_eq!(response, b"pong".to_vec());

        let calls = host.calls.lock().unwrap();
        assert_eq!(
            calls.as_slice(),
            &[(
                "wapc".to_string(),
                "LedgerService".to_string(),
                "ExistsState".to_string(),
                b"ping".to_vec()
            )]
        );
    }

    #[test]
    fn host_call_error_reaches_guest() {
        let host = RecordingHost::replying(Err("State 007 does not exist".to_string()));
        let mut instance = echo_instance(host);

        let err = instance.invoke("HReadState", b"").unwrap_err();
        assert!(matches!(err, ExecutorError::Guest(ref m) if m == "State 007 does not exist"));
    }

    #[test]
    fn invalid_module_bytes() {
        let host = RecordingHost::replying(Ok(Vec::new()));
        let result = WapcModule::new(&[0x00, 0x61, 0x73, 0x6d, 0xff], host);
        assert!(matches!(result, Err(ExecutorError::Module(_))));
    }

    #[test]
    fn module_without_guard_call() {
        let host = RecordingHost::replying(Ok(Vec::new()));
        let module = WapcModule::new(br#"(module (memory (export "memory") 1))"#, host).unwrap();
        assert!(matches!(
            module.instantiate(),
            Err(ExecutorError::Instantiate(_))
        ));
    }

    #[test]
    fn unknown_imports_trap_only_when_called() {
        let wat = r#"
            (module
              (import "env" "mystery" (func $mystery))
              (memory (export "memory") 1)
              (func (export "__guard_call") (param i32 i32) (result i32)
                (call $mystery)
                (i32.const 1)))
        "#;
        let host = RecordingHost::replying(Ok(Vec::new()));
        let mut instance = WapcModule::new(wat.as_bytes(), host)
            .unwrap()
            .instantiate()
            .unwrap();
        assert!(matches!(
            instance.invoke("Anything", b""),
            Err(ExecutorError::Trap(_))
        ));
    }

    #[test]
    fn out_of_bounds_guest_ranges_trap() {
        // One page of memory; every range below runs past it.
        let wat = r#"
            (module
              (import "wapc" "__console_log" (func $log (param i32 i32)))
              (import "wapc" "__host_call"
                (func $host_call (param i32 i32 i32 i32 i32 i32 i32 i32) (result i32)))
              (memory (export "memory") 1)
              (func (export "__guard_call") (param $op_len i32) (param i32) (result i32)
                (if (i32.eq (local.get $op_len) (i32.const 3))
                  (then (call $log (i32.const 0) (i32.const 0x7fffffff))))
                (if (i32.eq (local.get $op_len) (i32.const 4))
                  (then (call $log (i32.const 65535) (i32.const 2))))
                (drop (call $host_call
                  (i32.const 0) (i32.const 4)
                  (i32.const 0) (i32.const 4)
                  (i32.const 0) (i32.const 4)
                  (i32.const 16) (i32.const 0x7fffffff)))
                (i32.const 1)))
        "#;
        let host = RecordingHost::replying(Ok(Vec::new()));
        let mut instance = WapcModule::new(wat.as_bytes(), host.clone())
            .unwrap()
            .instantiate()
            .unwrap();

        for operation in ["Log", "Edge", "Forward"] {
            assert!(matches!(
                instance.invoke(operation, b""),
                Err(ExecutorError::Trap(_))
            ));
        }
        assert!(host.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn failed_call_without_guest_error() {
        let wat = r#"
            (module
              (memory (export "memory") 1)
              (func (export "__guard_call") (param i32 i32) (result i32)
                (i32.const 0)))
        "#;
        let host = RecordingHost::replying(Ok(Vec::new()));
        let mut instance = WapcModule::new(wat.as_bytes(), host)
            .unwrap()
            .instantiate()
            .unwrap();
        let err = instance.invoke("Anything", b"").unwrap_err();
        assert_eq!(err.to_string(), "guest call failed");
    }

    #[test]
    fn factory_creates_independent_instances() {
        let module = WapcModule::new(
            ECHO_GUEST.as_bytes(),
            RecordingHost::replying(Ok(Vec::new())),
        )
        .unwrap();
        let mut first = module.create().unwrap();
        let mut second = module.create().unwrap();

        assert_eq!(first.invoke("Echo", b"one").unwrap(), b"one".to_vec());
        assert_eq!(second.invoke("Echo", b"two").unwrap(), b"two".to_vec());
    }

    #[test]
    fn from_file() {
        use std::io::Write;
        let mut temp = tempfile::NamedTempFile::new().unwrap();
        temp.write_all(ECHO_GUEST.as_bytes()).unwrap();

        let module =
            WapcModule::from_file(temp.path(), RecordingHost::replying(Ok(Vec::new()))).unwrap();
        let mut instance = module.instantiate().unwrap();
        assert_eq!(instance.invoke("Echo", b"x").unwrap(), b"x".to_vec());
    }

    #[test]
    fn from_file_not_found() {
        let result = WapcModule::from_file(
            "/nonexistent/path/to/chaincode.wasm",
            RecordingHost::replying(Ok(Vec::new())),
        );
        assert!(matches!(result, Err(ExecutorError::Io(_))));
    }
}
