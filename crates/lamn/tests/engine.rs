mod common;

use common::{engine, num, output, run, run_err, s};
use lamn::{Engine, LamnError, Value, VmConfig};

#[test]
fn host_functions_receive_and_return_values() {
    let (mut engine, _) = engine();
    engine.register("add", |args| {
        let sum = args.iter().filter_map(Value::as_number).sum::<f64>();
        Ok(vec![Value::Number(sum)])
    });
    assert_eq!(engine.run("return add(1, 2, 3)", "host").unwrap(), vec![num(6.0)]);
}

#[test]
fn host_errors_are_catchable() {
    let (mut engine, _) = engine();
    engine.register("fail", |_| Err(LamnError::Runtime("host said no".into())));
    let results = engine.run("return pcall(fail)", "host").unwrap();
    assert_eq!(results, vec![Value::Boolean(false), s("host said no")]);
}

#[test]
fn globals_persist_between_runs() {
    let (mut engine, _) = engine();
    engine.run("counter = 1 function bump() counter = counter + 1 end", "setup").unwrap();
    engine.run("bump() bump()", "use").unwrap();
    assert_eq!(engine.get_global("counter"), num(3.0));
    engine.put_global("counter", Value::Nil);
    assert_eq!(engine.run("return counter", "check").unwrap(), vec![Value::Nil]);
}

#[test]
fn host_can_call_script_functions() {
    let (mut engine, _) = engine();
    engine.run("function greet(name) return 'hi ' .. name, #name end", "lib").unwrap();
    let greet = engine.get_global("greet");
    assert_eq!(
        engine.call(greet, vec![s("bo")]).unwrap(),
        vec![s("hi bo"), num(2.0)]
    );
}

#[test]
fn chunks_receive_varargs_from_load() {
    let src = "local f = load('local a, b = ... return a * b')
               return f(6, 7)";
    assert_eq!(run(src), vec![num(42.0)]);
}

#[test]
fn load_reports_syntax_errors_as_values() {
    let results = run("return load('return +')");
    assert_eq!(results[0], Value::Nil);
    assert!(results[1].to_string().contains("syntax error"));
}

#[test]
fn syntax_errors_surface_from_run() {
    assert!(matches!(run_err("local = 1"), LamnError::Syntax { line: 1, .. }));
}

#[test]
fn runtime_errors_name_the_chunk_and_line() {
    let err = run_err("local x = 1\nlocal y = x + {}");
    assert_eq!(
        err.to_string(),
        "test:2: attempt to perform arithmetic on a table value"
    );
}

#[test]
fn call_depth_is_configurable() {
    let mut engine = Engine::with_output(VmConfig::default().with_max_call_depth(10), std::io::sink());
    let src = "local function depth(n) if n == 0 then return 0 end return 1 + depth(n - 1) end
               return pcall(depth, 5), pcall(depth, 50)";
    let results = engine.run(src, "limits").unwrap();
    assert_eq!(results[0], Value::Boolean(true));
    assert_eq!(results[1], Value::Boolean(false));
}

#[test]
fn stack_size_is_configurable() {
    let mut engine = Engine::with_output(VmConfig::default().with_max_stack(64), std::io::sink());
    let src = "local function wide(n, ...) if n == 0 then return select('#', ...) end return wide(n - 1, n, ...) end
               return wide(100)";
    let err = engine.run(src, "limits").unwrap_err();
    assert!(err.to_string().contains("stack overflow"));
}

#[test]
fn the_engine_recovers_after_an_uncaught_error() {
    let (mut engine, _) = engine();
    assert!(engine.run("local t = nil; return t.x", "bad").is_err());
    assert_eq!(engine.run("return 'fine'", "good").unwrap(), vec![s("fine")]);
}

#[test]
fn print_goes_to_the_configured_sink() {
    assert_eq!(output("print('a', 1) print(nil)"), "a\t1\nnil\n");
}

#[test]
fn object_oriented_script() {
    let src = "local Account = {}
               Account.__index = Account
               function Account.new(balance) return setmetatable({balance = balance}, Account) end
               function Account:deposit(v) self.balance = self.balance + v end
               function Account:withdraw(v)
                 if v > self.balance then error('insufficient funds') end
                 self.balance = self.balance - v
               end
               local acc = Account.new(100)
               acc:deposit(50)
               local ok, e = pcall(acc.withdraw, acc, 500)
               acc:withdraw(30)
               return acc.balance, ok, e";
    assert_eq!(
        run(src),
        vec![num(120.0), Value::Boolean(false), s("insufficient funds")]
    );
}

#[test]
fn dostring_runs_in_the_same_globals() {
    let src = "counter = 1
               dostring('counter = counter + 1')
               local a, b = dostring('return counter, ...')
               return a, b";
    assert_eq!(run(src), vec![num(2.0), Value::Nil]);
    assert_eq!(
        run_err("dostring('local x = 1 + {}')").to_string(),
        "dostring:1: attempt to perform arithmetic on a table value"
    );
}

#[test]
fn large_tables_append_and_traverse_in_linear_time() {
    let src = "local t = {}
               for i = 1, 60000 do t[#t + 1] = i end
               local n, sum = 0, 0
               for k, v in pairs(t) do n = n + 1; sum = sum + v end
               for i = 1, 60000, 2 do t[i] = nil end
               local left = 0
               for k in pairs(t) do left = left + 1 end
               return #t, n, sum, left";
    let started = std::time::Instant::now();
    let results = run(src);
    assert_eq!(
        results,
        vec![num(60000.0), num(60000.0), num(1_800_030_000.0), num(30000.0)]
    );
    assert!(
        started.elapsed() < std::time::Duration::from_secs(20),
        "took {:?}",
        started.elapsed()
    );
}
