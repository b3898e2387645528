//! Built-in global functions (§6).
//!
//! Ordinary natives (no suspension) are registered as `ObjNative`s and
//! called through the normal `Call` dispatch path. The handful that must
//! park the calling coroutine — `sleep`, `serverAccept`, `socketRead`,
//! `socketWrite` — are recognized by name in `Vm::call_value` before it
//! would otherwise invoke the native body; their `ObjNative::function`
//! pointers are never actually called and just report that mis-wiring
//! loudly if they ever are.

use ember_core::{NativeContext, Value};

fn unreachable_async(_ctx: &mut dyn NativeContext, _args: &[Value]) -> Result<Value, String> {
    Err("internal error: async native invoked through the synchronous path".to_string())
}

fn native_clock(_ctx: &mut dyn NativeContext, _args: &[Value]) -> Result<Value, String> {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_err(|e| e.to_string())?;
    Ok(Value::Number(now.as_secs_f64()))
}

fn expect_instance(v: Value, who: &str) -> Result<ember_core::ObjRef, String> {
    match v {
        Value::Obj(o) if o.tag() == ember_core::ObjTag::Instance => Ok(o),
        other => Err(format!("{who} expects an instance, got {}", other.type_name())),
    }
}

fn expect_string(v: Value, who: &str) -> Result<ember_core::ObjRef, String> {
    match v {
        Value::Obj(o) if o.tag() == ember_core::ObjTag::String => Ok(o),
        other => Err(format!("{who} expects a string, got {}", other.type_name())),
    }
}

fn native_has_field(_ctx: &mut dyn NativeContext, args: &[Value]) -> Result<Value, String> {
    let inst = expect_instance(args[0], "hasField")?;
    let name = expect_string(args[1], "hasField")?;
    let instance = unsafe { inst.as_instance() };
    Ok(Value::Bool(instance.fields.contains(name)))
}

fn native_get_field(_ctx: &mut dyn NativeContext, args: &[Value]) -> Result<Value, String> {
    let inst = expect_instance(args[0], "getField")?;
    let name = expect_string(args[1], "getField")?;
    let instance = unsafe { inst.as_instance() };
    instance
        .fields
        .get(name)
        .ok_or_else(|| format!("undefined field '{}'", unsafe { name.as_string().as_str() }))
}

fn native_set_field(_ctx: &mut dyn NativeContext, args: &[Value]) -> Result<Value, String> {
    let inst = expect_instance(args[0], "setField")?;
    let name = expect_string(args[1], "setField")?;
    let instance = unsafe { inst.as_instance() };
    instance.fields.set(name, args[2]);
    Ok(args[2])
}

fn native_delete_field(_ctx: &mut dyn NativeContext, args: &[Value]) -> Result<Value, String> {
    let inst = expect_instance(args[0], "deleteField")?;
    let name = expect_string(args[1], "deleteField")?;
    let instance = unsafe { inst.as_instance() };
    Ok(Value::Bool(instance.fields.delete(name)))
}

fn native_array(ctx: &mut dyn NativeContext, args: &[Value]) -> Result<Value, String> {
    let len = match args[0] {
        Value::Number(n) if n >= 0.0 && n.fract() == 0.0 => n as usize,
        _ => return Err("Array length must be a non-negative integer".to_string()),
    };
    let fill = args.get(1).copied().unwrap_or(Value::Nil);
    let elements = vec![fill; len].into_boxed_slice();
    Ok(Value::Obj(ctx.alloc_array(elements)))
}

fn native_length(_ctx: &mut dyn NativeContext, args: &[Value]) -> Result<Value, String> {
    match args[0] {
        Value::Obj(o) if o.tag() == ember_core::ObjTag::Array => {
            Ok(Value::Number(unsafe { o.as_array() }.elements.len() as f64))
        }
        Value::Obj(o) if o.tag() == ember_core::ObjTag::String => {
            Ok(Value::Number(unsafe { o.as_string() }.len() as f64))
        }
        other => Err(format!("length() expects an array or string, got {}", other.type_name())),
    }
}

fn native_create_server(_ctx: &mut dyn NativeContext, _args: &[Value]) -> Result<Value, String> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error().to_string());
    }
    let optval: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
    Ok(Value::Number(fd as f64))
}

fn native_server_listen(_ctx: &mut dyn NativeContext, args: &[Value]) -> Result<Value, String> {
    let fd = match args[0] {
        Value::Number(n) => n as i32,
        _ => return Err("serverListen expects a server fd".to_string()),
    };
    let port = match args[1] {
        Value::Number(n) if n >= 0.0 && n <= 65535.0 => n as u16,
        _ => return Err("serverListen expects a port number".to_string()),
    };
    let backlog = args.get(2).and_then(Value::as_number).unwrap_or(128.0) as i32;

    let addr = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: port.to_be(),
        sin_addr: libc::in_addr { s_addr: 0 },
        sin_zero: [0; 8],
    };
    let rc = unsafe {
        libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(std::io::Error::last_os_error().to_string());
    }

    let rc = unsafe { libc::listen(fd, backlog) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error().to_string());
    }
    Ok(Value::Nil)
}

fn native_socket_close(_ctx: &mut dyn NativeContext, args: &[Value]) -> Result<Value, String> {
    let fd = match args[0] {
        Value::Number(n) => n as i32,
        _ => return Err("socketClose expects a socket fd".to_string()),
    };
    // Half-close the write side first so any data already queued for the
    // peer still drains, then fully close (§9 open question resolution:
    // shutdown(SHUT_WR) before close(), rather than an immediate close()
    // that risks an RST on unread peer data).
    unsafe {
        libc::shutdown(fd, libc::SHUT_WR);
        libc::close(fd);
    }
    Ok(Value::Nil)
}

pub const NATIVE_SLEEP: &str = "sleep";
pub const NATIVE_SERVER_ACCEPT: &str = "serverAccept";
pub const NATIVE_SOCKET_READ: &str = "socketRead";
pub const NATIVE_SOCKET_WRITE: &str = "socketWrite";

/// `(name, arity, body)` triples for [`crate::vm::Vm::install_natives`].
/// `arity` of `-1` means variadic (`Array`'s optional fill argument).
pub fn table() -> Vec<(&'static str, i32, ember_core::NativeFn)> {
    vec![
        ("clock", 0, native_clock as ember_core::NativeFn),
        ("hasField", 2, native_has_field as ember_core::NativeFn),
        ("getField", 2, native_get_field as ember_core::NativeFn),
        ("setField", 3, native_set_field as ember_core::NativeFn),
        ("deleteField", 2, native_delete_field as ember_core::NativeFn),
        ("Array", -1, native_array as ember_core::NativeFn),
        ("length", 1, native_length as ember_core::NativeFn),
        ("createServer", 0, native_create_server as ember_core::NativeFn),
        ("serverListen", -1, native_server_listen as ember_core::NativeFn),
        (NATIVE_SLEEP, 1, unreachable_async as ember_core::NativeFn),
        (NATIVE_SERVER_ACCEPT, 1, unreachable_async as ember_core::NativeFn),
        (NATIVE_SOCKET_READ, 1, unreachable_async as ember_core::NativeFn),
        (NATIVE_SOCKET_WRITE, 2, unreachable_async as ember_core::NativeFn),
        ("socketClose", 1, native_socket_close as ember_core::NativeFn),
    ]
}
