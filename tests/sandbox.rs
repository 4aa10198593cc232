//! End-to-end behaviour of the executor through its public API

use safepy::{ErrorKind, ExecutionResult, Executor, ExecutorConfig, Limits, Tool, Value};
use serde_json::json;

fn run(source: &str) -> ExecutionResult {
    Executor::default()
        .execute(source)
        .unwrap_or_else(|e| panic!("{}\n--- source ---\n{}", e, source))
}

fn repr(source: &str) -> String {
    format!("{:?}", run(source).value)
}

fn error_kind(source: &str) -> ErrorKind {
    Executor::default().execute(source).unwrap_err().kind()
}

#[test]
fn test_arithmetic_follows_python() {
    assert_eq!(repr("7 // 2, -7 // 2, 7 % -3, 2 ** -1, 10 / 4"), "(3, -4, -2, 0.5, 2.5)");
    assert_eq!(repr("1 < 2 < 3, 3 > 2 > 2"), "(True, False)");
    assert_eq!(repr("0.1 + 0.2"), "0.30000000000000004");
    assert_eq!(repr("divmod(-7, 2)"), "(-4, 1)");
}

#[test]
fn test_arithmetic_restrictions() {
    assert_eq!(error_kind("1 / 0"), ErrorKind::Arithmetic);
    assert_eq!(error_kind("5 % 0"), ErrorKind::Arithmetic);
    assert_eq!(error_kind("0 ** -1"), ErrorKind::Arithmetic);
    assert_eq!(error_kind("2 ** 64"), ErrorKind::Arithmetic);
    assert_eq!(error_kind("import math\nmath.sqrt(-1)"), ErrorKind::Arithmetic);
}

#[test]
fn test_functions_closures_and_defaults() {
    let source = "\
def make_counter(start=0):
    count = [start]
    def step(by=1):
        count[0] += by
        return count[0]
    return step

c = make_counter(10)
c()
c(5)
";
    assert_eq!(repr(source), "16");
    assert_eq!(repr("def f(a, *rest, k=2, **kw):\n    return a, rest, k, kw\nf(1, 2, 3, k=4, z=5)"),
        "(1, (2, 3), 4, {'z': 5})");
}

#[test]
fn test_comprehensions_and_builtins() {
    assert_eq!(repr("[x * x for x in range(6) if x % 2 == 0]"), "[0, 4, 16]");
    assert_eq!(repr("{k: v for k, v in zip('abc', range(3))}"), "{'a': 0, 'b': 1, 'c': 2}");
    assert_eq!(repr("sorted(['bb', 'a', 'ccc'], key=len, reverse=True)"), "['ccc', 'bb', 'a']");
    assert_eq!(repr("list(enumerate('xy', 1))"), "[(1, 'x'), (2, 'y')]");
    assert_eq!(repr("sum(x for x in range(101))"), "5050");
    assert_eq!(repr("first, *rest = [1, 2, 3]\nrest"), "[2, 3]");
}

#[test]
fn test_strings_and_formatting() {
    assert_eq!(repr("'-'.join('a b  c'.split())"), "'a-b-c'");
    assert_eq!(
        run("f'{3.14159:.2f}|{42:>5}|{\"x\"!r}'").value.to_string(),
        "3.14|   42|'x'"
    );
    assert_eq!(repr("'%s has %d items' % ('cart', 3)"), "'cart has 3 items'");
    assert_eq!(repr("'{}-{name}'.format(1, name='n')"), "'1-n'");
    assert_eq!(repr("'Hello'.upper(), 'abc'[::-1]"), "('HELLO', 'cba')");
}

#[test]
fn test_print_is_captured() {
    let result = run("print('a')\nprint('b')");
    assert_eq!(result.logs, "a\nb\n");
    assert!(result.value.is_none());

    let result = run("print(1, 2, sep=', ', end='!')");
    assert_eq!(result.logs, "1, 2!");
}

#[test]
fn test_output_truncation() {
    let config = ExecutorConfig {
        limits: Limits {
            max_output_len: 10,
            ..Limits::default()
        },
        ..Default::default()
    };
    let mut executor = Executor::with_config(std::iter::empty::<String>(), config);
    let result = executor.execute("for i in range(100):\n    print(i)").unwrap();
    assert!(result.logs.ends_with("..."));
    assert_eq!(result.logs.chars().count(), 13);
}

#[test]
fn test_final_answer_deep_in_call_stack() {
    let source = "\
def walk(items):
    for item in items:
        if isinstance(item, list):
            walk(item)
        elif item == 'needle':
            final_answer('found')
walk([1, [2, [3, ['needle']]]])
print('not reached')
";
    let result = run(source);
    assert!(result.is_final_answer);
    assert_eq!(result.value.to_string(), "found");
    assert_eq!(result.logs, "");
}

#[test]
fn test_import_gate() {
    let mut executor = Executor::default();
    let err = executor.execute("a = 1\nimport os\nb = 2").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ImportRestriction);
    assert!(executor.variable("a").is_some());
    assert!(executor.variable("b").is_none());

    assert_eq!(error_kind("import statistics"), ErrorKind::ImportRestriction);
    assert_eq!(error_kind("import collections.abc"), ErrorKind::ImportRestriction);
    assert_eq!(error_kind("from math import nothing_here"), ErrorKind::ImportRestriction);

    let mut opted_in = Executor::new(["statistics"]);
    let result = opted_in.execute("import statistics\nstatistics.median([3, 1, 2])").unwrap();
    assert_eq!(result.value.as_int().unwrap(), 2);
}

#[test]
fn test_denied_modules_cannot_be_allowed() {
    let executor = Executor::new(["os", "subprocess", "statistics"]);
    let allowed = executor.list_allowed_imports();
    assert!(!allowed.contains(&"os".to_string()));
    assert!(!allowed.contains(&"subprocess".to_string()));
    assert!(allowed.contains(&"statistics".to_string()));
}

#[test]
fn test_syntax_restrictions() {
    for source in [
        "(1).__class__",
        "[].__class__.__bases__",
        "eval('1')",
        "exec('x = 1')",
        "open('/etc/passwd')",
        "class A:\n    pass",
        "try:\n    x = 1\nexcept Exception:\n    pass",
        "with f() as g:\n    pass",
        "from math import *",
        "def f():\n    yield 1",
        "x = (",
        "b'bytes'",
    ] {
        assert_eq!(error_kind(source), ErrorKind::SyntaxRestriction, "{}", source);
    }
}

#[test]
fn test_runtime_limits() {
    assert_eq!(error_kind("while True:\n    pass"), ErrorKind::RuntimeRestriction);
    assert_eq!(
        error_kind("def f(n):\n    return f(n + 1)\nf(0)"),
        ErrorKind::RuntimeRestriction
    );
    assert_eq!(error_kind("[0] * 100_000_000"), ErrorKind::RuntimeRestriction);

    let config = ExecutorConfig {
        limits: Limits {
            max_operations: 1_000,
            ..Limits::default()
        },
        ..Default::default()
    };
    let mut executor = Executor::with_config(std::iter::empty::<String>(), config);
    let err = executor.execute("for i in range(10**6):\n    pass").unwrap_err();
    assert!(err.message().contains("operation limit"));
}

#[test]
fn test_errors_carry_line_numbers() {
    let err = Executor::default().execute("x = 1\ny = 2\nz = missing").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Name);
    assert_eq!(err.line(), Some(3));
    assert_eq!(err.to_string(), "NameError: name 'missing' is not defined (line 3)");
}

#[test]
fn test_state_persists_across_calls() {
    let mut executor = Executor::default();
    executor.define_variables([("prices", json!({"apple": 3, "pear": 5}))]).unwrap();
    executor
        .define_tools([(
            "tax",
            Tool::new(|mut args| {
                let rate = args.take_keyword("rate").map(|v| v.as_float()).transpose()?;
                let amount = args.positional[0].as_float()?;
                Ok(Value::Float(amount * (1.0 + rate.unwrap_or(0.5))))
            }),
        )])
        .unwrap();

    executor.execute("total = sum(prices.values())").unwrap();
    let result = executor.execute("tax(total, rate=0.25)").unwrap();
    assert_eq!(result.value.as_float().unwrap(), 10.0);

    executor.execute("def double(x):\n    return 2 * x").unwrap();
    let result = executor.execute("double(total)").unwrap();
    assert_eq!(result.value.as_int().unwrap(), 16);
}

#[test]
fn test_tool_errors_surface() {
    let mut executor = Executor::default();
    executor
        .define_tools([(
            "fail",
            Tool::new(|_| Err(safepy::SafepyError::RuntimeRestriction("backend down".into()))),
        )])
        .unwrap();
    let err = executor.execute("fail()").unwrap_err();
    assert_eq!(err.message(), "backend down");
}

#[test]
fn test_native_modules() {
    assert_eq!(
        repr("import json\njson.dumps({'a': [1, 2.0, None], 'b': True}, sort_keys=True)"),
        "'{\"a\": [1, 2.0, null], \"b\": true}'"
    );
    assert_eq!(repr("import json\njson.loads('{\"k\": [1, \"x\"]}')"), "{'k': [1, 'x']}");
    assert_eq!(
        repr("import re\nre.findall(r'\\d+', 'a1b22c333')"),
        "['1', '22', '333']"
    );
    assert_eq!(
        repr("import re\nre.sub(r'(\\w+)@(\\w+)', r'\\2 at \\1', 'me@host')"),
        "'host at me'"
    );
    assert_eq!(
        repr("from collections import Counter\nCounter('abracadabra').most_common(2)"),
        "[('a', 5), ('b', 2)]"
    );
    assert_eq!(
        repr("from itertools import combinations\nlist(combinations([1, 2, 3], 2))"),
        "[(1, 2), (1, 3), (2, 3)]"
    );
    assert_eq!(repr("from functools import reduce\nreduce(lambda a, b: a * b, [1, 2, 3, 4])"), "24");
    assert_eq!(
        repr("from datetime import date, timedelta\n(date(2024, 2, 28) + timedelta(days=2)).isoformat()"),
        "'2024-03-01'"
    );
    assert_eq!(repr("import math\nmath.gcd(12, 18), math.factorial(5)"), "(6, 120)");
}

#[test]
fn test_reset_clears_user_globals() {
    let mut executor = Executor::default();
    executor.execute("scratch = [1, 2]").unwrap();
    executor.reset();
    assert_eq!(
        executor.execute("scratch").unwrap_err().kind(),
        ErrorKind::Name
    );
}

#[test]
fn test_deep_nesting_is_survivable() {
    let source = "\
x = []
t = ()
for i in range(200000):
    x = [x]
    t = (i, t)
same = x == x
h = hash(t)
same
";
    let mut executor = Executor::default();
    let result = executor.execute(source).unwrap();
    assert_eq!(format!("{:?}", result.value), "True");
    executor.reset();
    drop(executor);
}

#[test]
fn test_growth_is_bounded() {
    for source in [
        "'x'.ljust(10**12)",
        "'7'.zfill(10**12)",
        "'\\t'.expandtabs(10**12)",
        "'{:>1000000000}'.format(1)",
        "f'{1:.1000000000f}'",
        "'%1000000000d' % 1",
        "s = 'x' * 1000\nwhile True:\n    s = s + s",
        "('ab' * 1000).replace('a', 'a' * 1000000)",
    ] {
        assert_eq!(error_kind(source), ErrorKind::RuntimeRestriction, "{}", source);
    }
}

#[test]
fn test_integer_edges_raise_overflow() {
    assert_eq!(
        error_kind("len(range(-9223372036854775807 - 1, 9223372036854775807))"),
        ErrorKind::Arithmetic
    );
    assert_eq!(
        error_kind("import math\nmath.gcd(-9223372036854775807 - 1, 0)"),
        ErrorKind::Arithmetic
    );
    assert_eq!(repr("round(1.5, -9223372036854775807 - 1)"), "0.0");
}

#[test]
fn test_argument_count_messages() {
    let err = Executor::default().execute("final_answer(1, 2)").unwrap_err();
    assert!(err.message().contains("takes at most 1 argument (2 given)"), "{}", err);
}
