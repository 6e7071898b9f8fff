//! Handlers compiled into the shim
//!
//! Module ids mirror the source layout a project would use, so
//! `fnshim src/lambda/users.rs handler users 3` resolves `src.lambda.users`.

use fnshim_runtime::{
    raise, traced, Decimal, ExecutionContext, HandlerError, Module, ModuleRegistry, Payload,
};
use serde_json::{json, Value};

pub fn registry() -> ModuleRegistry {
    ModuleRegistry::new()
        .with(
            Module::new("src.lambda.hello_world")
                .import("src.lib.format")
                .function("handler", hello_world),
        )
        .with(
            Module::new("src.lambda.counter")
                .import("src.lib.format")
                .import("serde_json")
                .function("handler", counter),
        )
        .with(
            Module::new("src.lambda.users")
                .import("src.lib.store")
                .import("serde_json")
                .function("handler", get_user)
                .function("explode", explode)
                .value("TABLE_NAME", json!(store::TABLE_NAME)),
        )
        .with(
            Module::new("src.lib.store")
                .import("src.lib.format")
                .on_load(store::connect),
        )
        .with(Module::new("src.lib.format"))
        .with(Module::new("serde_json"))
}

fn hello_world(event: Value, ctx: &ExecutionContext) -> Result<Value, HandlerError> {
    let name = event["name"].as_str().unwrap_or("world");
    Ok(json!({
        "message": format::greeting(name),
        "functionName": ctx.function_name(),
        "requestId": ctx.aws_request_id(),
        "memoryLimitInMB": ctx.memory_limit_in_mb(),
    }))
}

fn counter(event: Value, ctx: &ExecutionContext) -> Result<Value, HandlerError> {
    let Some(x) = event["x"].as_i64() else {
        raise!("KeyError", "x");
    };
    ctx.log(format!(
        "counter: x={x} remaining={}ms",
        ctx.get_remaining_time_in_millis()
    ));
    Ok(json!({"y": x + 1}))
}

fn get_user(event: Value, ctx: &ExecutionContext) -> Result<Payload, HandlerError> {
    let id = event["id"].as_str().unwrap_or_default();
    ctx.log(format!("looking up user {id}"));
    let user = traced!(store::find_user(id));
    Ok(user)
}

fn explode(event: Value, _ctx: &ExecutionContext) -> Result<Value, HandlerError> {
    let reason = event["reason"].as_str().unwrap_or("explode called");
    panic!("{reason}");
}

mod format {
    pub fn greeting(name: &str) -> String {
        format!("Hello, {name}!")
    }
}

mod store {
    use super::{Decimal, HandlerError, Payload};
    use fnshim_runtime::raise;

    pub const TABLE_NAME: &str = "users";

    pub fn connect() -> Result<(), String> {
        match std::env::var("FNSHIM_STORE_FAIL") {
            Ok(reason) => Err(reason),
            Err(_) => Ok(()),
        }
    }

    pub fn find_user(id: &str) -> Result<Payload, HandlerError> {
        let (name, cents) = match id {
            "1" => ("Ada", 1050),
            "2" => ("Grace", 2000),
            _ => raise!("KeyError", "{}", id),
        };
        Ok(Payload::object([
            ("id", Payload::from(id)),
            ("name", Payload::from(name)),
            ("balance", Payload::from(Decimal::new(cents, 2))),
        ]))
    }
}
