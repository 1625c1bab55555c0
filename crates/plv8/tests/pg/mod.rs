use pgrx::JsonB;
use pgrx::prelude::*;
use serde_json::Value;

fn reset_schema(schema: &str) {
    Spi::run(&format!("DROP SCHEMA IF EXISTS {schema} CASCADE; CREATE SCHEMA {schema};"))
        .expect("schema reset should succeed");
}

fn drop_schema(schema: &str) {
    Spi::run(&format!("DROP SCHEMA IF EXISTS {schema} CASCADE;"))
        .expect("schema teardown should succeed");
}

/// Runs `statement` inside a DO block and fails unless it raises an error
/// whose message contains `needle`.
fn expect_error(statement: &str, needle: &str) {
    let statement = statement.replace('\'', "''");
    let needle = needle.replace('\'', "''");
    Spi::run(&format!(
        "
        DO $guard$
        BEGIN
            EXECUTE '{statement}';
            RAISE EXCEPTION 'expected failure did not happen';
        EXCEPTION
            WHEN OTHERS THEN
                IF POSITION('{needle}' IN SQLERRM) = 0 THEN
                    RAISE;
                END IF;
        END;
        $guard$;
        "
    ))
    .expect("statement should fail with the expected message");
}

#[pg_test]
fn test_languages_and_domains_are_installed() {
    let languages = Spi::get_one::<i64>(
        "SELECT count(*) FROM pg_language WHERE lanname IN ('plv8', 'plcoffee', 'plls') AND lanpltrusted",
    )
    .expect("pg_language query should succeed")
    .expect("count should return a row");
    assert_eq!(languages, 3);

    let domains = Spi::get_one::<i64>(
        "
        SELECT count(*) FROM pg_type
        WHERE typname IN ('plv8_int2array', 'plv8_int4array', 'plv8_float4array', 'plv8_float8array')
          AND typtype = 'd'
        ",
    )
    .expect("pg_type query should succeed")
    .expect("count should return a row");
    assert_eq!(domains, 4);
}

#[pg_test]
fn test_version_reports_package_version() {
    let version = Spi::get_one::<String>("SELECT plv8.version()")
        .expect("version query should succeed")
        .expect("version should not be null");
    assert_eq!(version, env!("CARGO_PKG_VERSION"));
}

#[pg_test]
fn test_scalar_function_receives_named_arguments() {
    reset_schema("plv8_scalar_it");
    Spi::run(
        "
        CREATE FUNCTION plv8_scalar_it.add(a int4, b int4) RETURNS int4
        LANGUAGE plv8 AS $$ return a + b; $$;
        CREATE FUNCTION plv8_scalar_it.greet(name text) RETURNS text
        LANGUAGE plv8 AS $$ return 'hello ' + name; $$;
        CREATE FUNCTION plv8_scalar_it.positional(int4, int4) RETURNS int4
        LANGUAGE plv8 AS $$ return $1 * $2; $$;
        CREATE FUNCTION plv8_scalar_it.is_null(v text) RETURNS boolean
        LANGUAGE plv8 AS $$ return v === null; $$;
        ",
    )
    .expect("scalar setup SQL should succeed");

    let sum = Spi::get_one::<i32>("SELECT plv8_scalar_it.add(40, 2)")
        .expect("add query should succeed")
        .expect("add should return a value");
    assert_eq!(sum, 42);

    let greeting = Spi::get_one::<String>("SELECT plv8_scalar_it.greet('world')")
        .expect("greet query should succeed")
        .expect("greet should return a value");
    assert_eq!(greeting, "hello world");

    let product = Spi::get_one::<i32>("SELECT plv8_scalar_it.positional(6, 7)")
        .expect("positional query should succeed")
        .expect("positional should return a value");
    assert_eq!(product, 42);

    let null_seen = Spi::get_one::<bool>("SELECT plv8_scalar_it.is_null(NULL)")
        .expect("is_null query should succeed")
        .expect("is_null should return a value");
    assert!(null_seen, "SQL NULL should arrive as JS null");

    drop_schema("plv8_scalar_it");
}

#[pg_test]
fn test_null_and_undefined_results_become_sql_null() {
    reset_schema("plv8_null_it");
    Spi::run(
        "
        CREATE FUNCTION plv8_null_it.nothing() RETURNS text
        LANGUAGE plv8 AS $$ return undefined; $$;
        CREATE FUNCTION plv8_null_it.nil() RETURNS text
        LANGUAGE plv8 AS $$ return null; $$;
        ",
    )
    .expect("null setup SQL should succeed");

    let undefined_is_null = Spi::get_one::<bool>("SELECT plv8_null_it.nothing() IS NULL")
        .expect("nothing query should succeed")
        .expect("IS NULL should return a row");
    assert!(undefined_is_null);

    let null_is_null = Spi::get_one::<bool>("SELECT plv8_null_it.nil() IS NULL")
        .expect("nil query should succeed")
        .expect("IS NULL should return a row");
    assert!(null_is_null);

    drop_schema("plv8_null_it");
}

#[pg_test]
fn test_json_values_pass_through_as_objects() {
    reset_schema("plv8_json_it");
    Spi::run(
        "
        CREATE FUNCTION plv8_json_it.tag(doc jsonb) RETURNS jsonb
        LANGUAGE plv8 AS $$ doc.tagged = true; doc.count = doc.items.length; return doc; $$;
        ",
    )
    .expect("json setup SQL should succeed");

    let payload = Spi::get_one::<JsonB>("SELECT plv8_json_it.tag('{\"items\": [1, 2, 3]}'::jsonb)")
        .expect("tag query should succeed")
        .expect("tag should return jsonb");
    assert_eq!(payload.0.get("tagged").and_then(Value::as_bool), Some(true));
    assert_eq!(payload.0.get("count").and_then(Value::as_i64), Some(3));

    drop_schema("plv8_json_it");
}

#[pg_test]
fn test_arrays_and_typed_array_domains() {
    reset_schema("plv8_array_it");
    Spi::run(
        "
        CREATE FUNCTION plv8_array_it.total(xs int4[]) RETURNS int4
        LANGUAGE plv8 AS $$ return xs.reduce(function (a, b) { return a + b; }, 0); $$;
        CREATE FUNCTION plv8_array_it.typed_total(xs plv8_int4array) RETURNS float8
        LANGUAGE plv8 AS $$
            var sum = 0;
            for (var i = 0; i < xs.length; i++) { sum += xs[i]; }
            return sum;
        $$;
        CREATE FUNCTION plv8_array_it.doubled(xs float8[]) RETURNS float8[]
        LANGUAGE plv8 AS $$ return xs.map(function (x) { return x * 2; }); $$;
        ",
    )
    .expect("array setup SQL should succeed");

    let total = Spi::get_one::<i32>("SELECT plv8_array_it.total(ARRAY[1, 2, 3, 4])")
        .expect("total query should succeed")
        .expect("total should return a value");
    assert_eq!(total, 10);

    let typed = Spi::get_one::<f64>(
        "SELECT plv8_array_it.typed_total(ARRAY[5, 6, 7]::int4[]::plv8_int4array)",
    )
    .expect("typed_total query should succeed")
    .expect("typed_total should return a value");
    assert!((typed - 18.0).abs() < f64::EPSILON);

    let doubled = Spi::get_one::<String>("SELECT plv8_array_it.doubled(ARRAY[1.5, 2]::float8[])::text")
        .expect("doubled query should succeed")
        .expect("doubled should return a value");
    assert_eq!(doubled, "{3,4}");

    drop_schema("plv8_array_it");
}

#[pg_test]
fn test_multidimensional_arrays_round_trip() {
    reset_schema("plv8_mdarray_it");
    Spi::run(
        "
        CREATE FUNCTION plv8_mdarray_it.echo(a int4[]) RETURNS int4[]
        LANGUAGE plv8 AS $$ return a; $$;
        CREATE FUNCTION plv8_mdarray_it.grid() RETURNS text[]
        LANGUAGE plv8 AS $$ return [['a', 'b'], ['c', 'd']]; $$;
        CREATE FUNCTION plv8_mdarray_it.ragged() RETURNS int4[]
        LANGUAGE plv8 AS $$ return [[1, 2], [3]]; $$;
        ",
    )
    .expect("multidimensional array setup SQL should succeed");

    let echoed = Spi::get_one::<String>("SELECT plv8_mdarray_it.echo('{{1,2},{3,4}}')::text")
        .expect("echo query should succeed")
        .expect("echo should return a value");
    assert_eq!(echoed, "{{1,2},{3,4}}");

    let dims = Spi::get_one::<String>("SELECT array_dims(plv8_mdarray_it.echo('{{1,2},{3,4}}'))")
        .expect("array_dims query should succeed")
        .expect("array_dims should return a value");
    assert_eq!(dims, "[1:2][1:2]");

    let grid = Spi::get_one::<String>("SELECT plv8_mdarray_it.grid()::text")
        .expect("grid query should succeed")
        .expect("grid should return a value");
    assert_eq!(grid, "{{a,b},{c,d}}");

    expect_error("SELECT plv8_mdarray_it.ragged()", "matching dimensions");

    drop_schema("plv8_mdarray_it");
}

#[pg_test]
fn test_set_returning_function_with_return_next_and_array() {
    reset_schema("plv8_srf_it");
    Spi::run(
        "
        CREATE FUNCTION plv8_srf_it.counter(n int4) RETURNS SETOF int4
        LANGUAGE plv8 AS $$
            for (var i = 1; i <= n; i++) { plv8.return_next(i); }
        $$;
        CREATE FUNCTION plv8_srf_it.pairs() RETURNS TABLE (k text, v int4)
        LANGUAGE plv8 AS $$
            return [{ k: 'a', v: 1 }, { k: 'b', v: 2 }];
        $$;
        ",
    )
    .expect("srf setup SQL should succeed");

    let sum = Spi::get_one::<i64>("SELECT sum(x) FROM plv8_srf_it.counter(4) AS x")
        .expect("counter query should succeed")
        .expect("sum should return a value");
    assert_eq!(sum, 10);

    let joined = Spi::get_one::<String>(
        "SELECT string_agg(k || '=' || v, ',' ORDER BY k) FROM plv8_srf_it.pairs()",
    )
    .expect("pairs query should succeed")
    .expect("string_agg should return a value");
    assert_eq!(joined, "a=1,b=2");

    drop_schema("plv8_srf_it");
}

#[pg_test]
fn test_nested_set_function_keeps_outer_rows_in_order() {
    reset_schema("plv8_nested_srf_it");
    Spi::run(
        "
        CREATE FUNCTION plv8_nested_srf_it.inner_rows(n int4) RETURNS SETOF int4
        LANGUAGE plv8 AS $$
            for (var i = 1; i <= n; i++) { plv8.return_next(100 + i); }
        $$;
        CREATE FUNCTION plv8_nested_srf_it.outer_rows() RETURNS SETOF int4
        LANGUAGE plv8 AS $$
            plv8.return_next(1);
            var inner = plv8.execute('SELECT x FROM plv8_nested_srf_it.inner_rows(3) AS x');
            plv8.return_next(2);
            plv8.return_next(inner.length * 10);
            plv8.return_next(inner[1].x);
            plv8.return_next(3);
        $$;
        ",
    )
    .expect("nested srf setup SQL should succeed");

    let produced = Spi::get_one::<String>(
        "SELECT array_agg(x ORDER BY ord)::text
         FROM plv8_nested_srf_it.outer_rows() WITH ORDINALITY AS t(x, ord)",
    )
    .expect("outer_rows query should succeed")
    .expect("array_agg should return a value");
    assert_eq!(produced, "{1,2,30,102,3}");

    drop_schema("plv8_nested_srf_it");
}

#[pg_test]
fn test_return_next_outside_set_function_fails() {
    reset_schema("plv8_srf_err_it");
    Spi::run(
        "
        CREATE FUNCTION plv8_srf_err_it.bad() RETURNS int4
        LANGUAGE plv8 AS $$ plv8.return_next(1); return 1; $$;
        ",
    )
    .expect("return_next setup SQL should succeed");

    expect_error("SELECT plv8_srf_err_it.bad()", "return_next");

    drop_schema("plv8_srf_err_it");
}

#[pg_test]
fn test_record_results_and_shape_mismatch() {
    reset_schema("plv8_record_it");
    Spi::run(
        "
        CREATE TYPE plv8_record_it.point AS (x int4, y int4);
        CREATE FUNCTION plv8_record_it.origin() RETURNS plv8_record_it.point
        LANGUAGE plv8 AS $$ return { x: 3, y: 4 }; $$;
        CREATE FUNCTION plv8_record_it.out_params(OUT a text, OUT b int4)
        LANGUAGE plv8 AS $$ return { a: 'left', b: 9 }; $$;
        CREATE FUNCTION plv8_record_it.missing() RETURNS plv8_record_it.point
        LANGUAGE plv8 AS $$ return { x: 1 }; $$;
        ",
    )
    .expect("record setup SQL should succeed");

    let distance = Spi::get_one::<i32>("SELECT (p).x * (p).x + (p).y * (p).y FROM plv8_record_it.origin() AS p")
        .expect("origin query should succeed")
        .expect("origin should return a row");
    assert_eq!(distance, 25);

    let out = Spi::get_one::<String>("SELECT a || b FROM plv8_record_it.out_params()")
        .expect("out_params query should succeed")
        .expect("out_params should return a row");
    assert_eq!(out, "left9");

    expect_error("SELECT plv8_record_it.missing()", "different cardinality");

    drop_schema("plv8_record_it");
}

#[pg_test]
fn test_trigger_can_modify_and_skip_rows() {
    reset_schema("plv8_trigger_it");
    Spi::run(
        "
        CREATE TABLE plv8_trigger_it.items(id int4, label text);
        CREATE TABLE plv8_trigger_it.audit(op text, level text, arg text);
        CREATE FUNCTION plv8_trigger_it.shape() RETURNS trigger
        LANGUAGE plv8 AS $$
            plv8.execute(
                'INSERT INTO plv8_trigger_it.audit VALUES ($1, $2, $3)',
                [TG_OP, TG_LEVEL, TG_ARGV[0]]
            );
            if (NEW.id < 0) { return null; }
            NEW.label = NEW.label.toUpperCase();
            return NEW;
        $$;
        CREATE TRIGGER shape_items BEFORE INSERT ON plv8_trigger_it.items
        FOR EACH ROW EXECUTE FUNCTION plv8_trigger_it.shape('tagged');
        INSERT INTO plv8_trigger_it.items VALUES (1, 'one'), (-1, 'skipped');
        ",
    )
    .expect("trigger setup SQL should succeed");

    let labels = Spi::get_one::<String>("SELECT string_agg(label, ',') FROM plv8_trigger_it.items")
        .expect("items query should succeed")
        .expect("string_agg should return a value");
    assert_eq!(labels, "ONE");

    let audit = Spi::get_one::<String>(
        "SELECT string_agg(DISTINCT op || ':' || level || ':' || arg, ',') FROM plv8_trigger_it.audit",
    )
    .expect("audit query should succeed")
    .expect("audit should return a value");
    assert_eq!(audit, "INSERT:ROW:tagged");

    drop_schema("plv8_trigger_it");
}

#[pg_test]
fn test_trigger_update_delete_and_statement_events() {
    reset_schema("plv8_trigger_ops_it");
    Spi::run(
        "
        CREATE TABLE plv8_trigger_ops_it.items(id int4, label text);
        CREATE TABLE plv8_trigger_ops_it.audit(entry text);
        CREATE FUNCTION plv8_trigger_ops_it.keep_original() RETURNS trigger
        LANGUAGE plv8 AS $$
            NEW.label = 'ignored';
        $$;
        CREATE FUNCTION plv8_trigger_ops_it.on_update() RETURNS trigger
        LANGUAGE plv8 AS $$
            plv8.execute(
                'INSERT INTO plv8_trigger_ops_it.audit VALUES ($1)',
                ['update:' + OLD.label + '>' + NEW.label]
            );
            NEW.label = NEW.label + '!';
            return NEW;
        $$;
        CREATE FUNCTION plv8_trigger_ops_it.on_delete() RETURNS trigger
        LANGUAGE plv8 AS $$
            plv8.execute(
                'INSERT INTO plv8_trigger_ops_it.audit VALUES ($1)',
                ['delete:' + typeof NEW + ':' + OLD.id]
            );
        $$;
        CREATE FUNCTION plv8_trigger_ops_it.per_statement() RETURNS trigger
        LANGUAGE plv8 AS $$
            plv8.execute(
                'INSERT INTO plv8_trigger_ops_it.audit VALUES ($1)',
                ['statement:' + TG_LEVEL + ':' + typeof NEW + ':' + typeof OLD]
            );
            return { id: 99, label: 'never stored' };
        $$;
        CREATE TRIGGER keep_original BEFORE INSERT ON plv8_trigger_ops_it.items
        FOR EACH ROW EXECUTE FUNCTION plv8_trigger_ops_it.keep_original();
        CREATE TRIGGER on_update BEFORE UPDATE ON plv8_trigger_ops_it.items
        FOR EACH ROW EXECUTE FUNCTION plv8_trigger_ops_it.on_update();
        CREATE TRIGGER on_delete BEFORE DELETE ON plv8_trigger_ops_it.items
        FOR EACH ROW EXECUTE FUNCTION plv8_trigger_ops_it.on_delete();
        CREATE TRIGGER per_statement BEFORE INSERT ON plv8_trigger_ops_it.items
        FOR EACH STATEMENT EXECUTE FUNCTION plv8_trigger_ops_it.per_statement();

        INSERT INTO plv8_trigger_ops_it.items VALUES (1, 'a'), (2, 'b');
        UPDATE plv8_trigger_ops_it.items SET label = 'c' WHERE id = 1;
        DELETE FROM plv8_trigger_ops_it.items WHERE id = 2;
        ",
    )
    .expect("trigger operations SQL should succeed");

    let rows = Spi::get_one::<String>(
        "SELECT string_agg(id || ':' || label, ',' ORDER BY id) FROM plv8_trigger_ops_it.items",
    )
    .expect("items query should succeed")
    .expect("string_agg should return a value");
    assert_eq!(rows, "1:c!", "undefined keeps the inserted row, UPDATE sees OLD and NEW, DELETE proceeds");

    let audit = Spi::get_one::<String>(
        "SELECT string_agg(entry, ',' ORDER BY entry) FROM plv8_trigger_ops_it.audit",
    )
    .expect("audit query should succeed")
    .expect("string_agg should return a value");
    assert_eq!(audit, "delete:undefined:2,statement:STATEMENT:undefined:undefined,update:a>c");

    drop_schema("plv8_trigger_ops_it");
}

#[pg_test]
fn test_replaced_function_is_recompiled() {
    reset_schema("plv8_replace_it");
    Spi::run(
        "
        CREATE FUNCTION plv8_replace_it.answer() RETURNS int4
        LANGUAGE plv8 AS $$ return 1; $$;
        ",
    )
    .expect("first definition should succeed");

    let first = Spi::get_one::<i32>("SELECT plv8_replace_it.answer()")
        .expect("first call should succeed")
        .expect("first call should return a value");
    assert_eq!(first, 1);

    Spi::run(
        "
        CREATE OR REPLACE FUNCTION plv8_replace_it.answer() RETURNS int4
        LANGUAGE plv8 AS $$ return 2; $$;
        ",
    )
    .expect("replacement should succeed");

    let second = Spi::get_one::<i32>("SELECT plv8_replace_it.answer()")
        .expect("second call should succeed")
        .expect("second call should return a value");
    assert_eq!(second, 2);

    drop_schema("plv8_replace_it");
}

#[pg_test]
fn test_globals_are_isolated_per_user() {
    reset_schema("plv8_user_it");
    Spi::run(
        "
        DO $$
        BEGIN
            IF NOT EXISTS (SELECT 1 FROM pg_roles WHERE rolname = 'plv8_it_other') THEN
                CREATE ROLE plv8_it_other;
            END IF;
        END;
        $$;
        CREATE FUNCTION plv8_user_it.remember(v text) RETURNS text
        LANGUAGE plv8 AS $$
            var previous = typeof globalThis.remembered === 'undefined' ? 'none' : globalThis.remembered;
            globalThis.remembered = v;
            return previous;
        $$;
        GRANT USAGE ON SCHEMA plv8_user_it TO plv8_it_other;
        GRANT EXECUTE ON FUNCTION plv8_user_it.remember(text) TO plv8_it_other;
        ",
    )
    .expect("per-user setup SQL should succeed");

    Spi::run("SELECT plv8_user_it.remember('owner')").expect("owner call should succeed");
    let owner_again = Spi::get_one::<String>("SELECT plv8_user_it.remember('owner2')")
        .expect("second owner call should succeed")
        .expect("remember should return a value");
    assert_eq!(owner_again, "owner");

    Spi::run("SET LOCAL ROLE plv8_it_other").expect("SET ROLE should succeed");
    let other = Spi::get_one::<String>("SELECT plv8_user_it.remember('other')")
        .expect("other-user call should succeed")
        .expect("remember should return a value");
    Spi::run("RESET ROLE").expect("RESET ROLE should succeed");
    assert_eq!(other, "none", "another user must not see the owner's globals");

    drop_schema("plv8_user_it");
}

fn ensure_role(role: &str, schema: &str) {
    Spi::run(&format!(
        "
        DO $$
        BEGIN
            IF NOT EXISTS (SELECT 1 FROM pg_roles WHERE rolname = '{role}') THEN
                CREATE ROLE {role};
            END IF;
        END;
        $$;
        GRANT USAGE ON SCHEMA {schema} TO {role};
        GRANT USAGE, UPDATE ON ALL SEQUENCES IN SCHEMA {schema} TO {role};
        "
    ))
    .expect("role setup should succeed");
}

#[pg_test]
fn test_start_proc_runs_once_per_new_context() {
    reset_schema("plv8_start_once_it");
    Spi::run(
        "
        CREATE FUNCTION plv8_start_once_it.init() RETURNS void
        LANGUAGE plv8 AS $$ globalThis.start_runs = (globalThis.start_runs || 0) + 1; $$;
        CREATE FUNCTION plv8_start_once_it.runs() RETURNS int4
        LANGUAGE plv8 AS $$ return globalThis.start_runs || 0; $$;
        CREATE FUNCTION plv8_start_once_it.runs_again() RETURNS int4
        LANGUAGE plv8 AS $$ return globalThis.start_runs || 0; $$;
        ",
    )
    .expect("start_proc setup SQL should succeed");
    ensure_role("plv8_it_start_once", "plv8_start_once_it");

    Spi::run("SET LOCAL plv8.start_proc = 'plv8_start_once_it.init'")
        .expect("setting start_proc should succeed");
    Spi::run("SET LOCAL ROLE plv8_it_start_once").expect("SET ROLE should succeed");
    let first = Spi::get_one::<i32>("SELECT plv8_start_once_it.runs()")
        .expect("first call should succeed")
        .expect("runs should return a value");
    let second = Spi::get_one::<i32>("SELECT plv8_start_once_it.runs()")
        .expect("second call should succeed")
        .expect("runs should return a value");
    let other = Spi::get_one::<i32>("SELECT plv8_start_once_it.runs_again()")
        .expect("other function call should succeed")
        .expect("runs_again should return a value");
    Spi::run("RESET ROLE; RESET plv8.start_proc;").expect("reset should succeed");

    assert_eq!((first, second, other), (1, 1, 1), "start_proc must run once per context");

    drop_schema("plv8_start_once_it");
}

#[pg_test]
fn test_missing_start_proc_only_warns() {
    reset_schema("plv8_start_missing_it");
    Spi::run(
        "
        CREATE FUNCTION plv8_start_missing_it.ping() RETURNS text
        LANGUAGE plv8 AS $$ return 'pong'; $$;
        CREATE TABLE plv8_start_missing_it.log (v text);
        ",
    )
    .expect("missing start_proc setup SQL should succeed");
    ensure_role("plv8_it_start_missing", "plv8_start_missing_it");

    Spi::run("SET LOCAL plv8.start_proc = 'plv8_start_missing_it.no_such_init'")
        .expect("setting start_proc should succeed");
    Spi::run("SET LOCAL ROLE plv8_it_start_missing").expect("SET ROLE should succeed");
    let pong = Spi::get_one::<String>("SELECT plv8_start_missing_it.ping()")
        .expect("call with an unresolvable start_proc should succeed")
        .expect("ping should return a value");
    Spi::run("RESET ROLE; RESET plv8.start_proc;").expect("reset should succeed");
    assert_eq!(pong, "pong");

    // the failed lookup left no aborted state behind
    Spi::run("INSERT INTO plv8_start_missing_it.log VALUES ('after')")
        .expect("the transaction should still accept writes");
    let logged = Spi::get_one::<i64>("SELECT count(*) FROM plv8_start_missing_it.log")
        .expect("count query should succeed")
        .expect("count should return a value");
    assert_eq!(logged, 1);

    drop_schema("plv8_start_missing_it");
}

#[pg_test]
fn test_failing_start_proc_discards_the_context() {
    reset_schema("plv8_start_throw_it");
    Spi::run(
        "
        CREATE SEQUENCE plv8_start_throw_it.attempts;
        CREATE FUNCTION plv8_start_throw_it.init() RETURNS void
        LANGUAGE plv8 AS $$
            var n = plv8.execute(\"SELECT nextval('plv8_start_throw_it.attempts')::int4 AS n\")[0].n;
            if (n === 1) { throw new Error('first start fails'); }
            globalThis.started_at = n;
        $$;
        CREATE FUNCTION plv8_start_throw_it.started_at() RETURNS int4
        LANGUAGE plv8 AS $$ return globalThis.started_at; $$;
        ",
    )
    .expect("failing start_proc setup SQL should succeed");
    ensure_role("plv8_it_start_throws", "plv8_start_throw_it");

    Spi::run("SET LOCAL plv8.start_proc = 'plv8_start_throw_it.init'")
        .expect("setting start_proc should succeed");
    Spi::run("SET LOCAL ROLE plv8_it_start_throws").expect("SET ROLE should succeed");
    expect_error("SELECT plv8_start_throw_it.started_at()", "first start fails");
    let started_at = Spi::get_one::<i32>("SELECT plv8_start_throw_it.started_at()")
        .expect("the call after a failed start should succeed")
        .expect("started_at should return a value");
    Spi::run("RESET ROLE; RESET plv8.start_proc;").expect("reset should succeed");

    assert_eq!(started_at, 2, "the context must be rebuilt and start_proc rerun");

    drop_schema("plv8_start_throw_it");
}

/// Calls `statement` and fails unless it raises an error whose message
/// contains `message` and whose detail contains `detail`.
fn expect_error_detail(statement: &str, message: &str, detail: &str) {
    let statement = statement.replace('\'', "''");
    let message = message.replace('\'', "''");
    let detail = detail.replace('\'', "''");
    Spi::run(&format!(
        "
        DO $guard$
        DECLARE
            reported text;
        BEGIN
            EXECUTE '{statement}';
            RAISE EXCEPTION 'expected failure did not happen';
        EXCEPTION
            WHEN OTHERS THEN
                GET STACKED DIAGNOSTICS reported = PG_EXCEPTION_DETAIL;
                IF POSITION('{message}' IN SQLERRM) = 0 THEN
                    RAISE;
                END IF;
                IF POSITION('{detail}' IN coalesce(reported, '')) = 0 THEN
                    RAISE EXCEPTION 'unexpected detail: %', reported;
                END IF;
        END;
        $guard$;
        "
    ))
    .expect("statement should fail with the expected message and detail");
}

#[pg_test]
fn test_thrown_errors_carry_message_and_line_detail() {
    reset_schema("plv8_throw_it");
    Spi::run(
        "
        CREATE FUNCTION plv8_throw_it.boom() RETURNS int4
        LANGUAGE plv8 AS $$
            var x = 1;
            throw new Error('kaboom');
        $$;
        CREATE FUNCTION plv8_throw_it.bad_query() RETURNS int4
        LANGUAGE plv8 AS $$
            var rows = plv8.execute('SELECT * FROM plv8_throw_it.missing_table');
            return rows.length;
        $$;
        ",
    )
    .expect("throw setup SQL should succeed");

    expect_error_detail(
        "SELECT plv8_throw_it.boom()",
        "kaboom",
        "boom() LINE 3:",
    );
    expect_error_detail(
        "SELECT plv8_throw_it.bad_query()",
        "plv8_throw_it.missing_table",
        "bad_query() LINE 2:",
    );

    drop_schema("plv8_throw_it");
}

#[pg_test]
fn test_coffeescript_without_compiler_reports_disabled() {
    if option_env!("PLV8_COFFEE_SCRIPT_JS").is_some_and(|path| !path.is_empty()) {
        return;
    }
    reset_schema("plv8_coffee_it");

    expect_error(
        "CREATE FUNCTION plv8_coffee_it.hi() RETURNS text LANGUAGE plcoffee AS $$ 'hi' $$",
        "CoffeeScript is not enabled",
    );

    Spi::run("SET LOCAL check_function_bodies = off").expect("disabling body checks should succeed");
    Spi::run(
        "
        CREATE FUNCTION plv8_coffee_it.hi() RETURNS text
        LANGUAGE plcoffee AS $$ 'hi' $$;
        ",
    )
    .expect("plcoffee definition should be accepted without body checks");
    expect_error("SELECT plv8_coffee_it.hi()", "CoffeeScript is not enabled");

    drop_schema("plv8_coffee_it");
}

#[pg_test]
fn test_elog_levels_and_error() {
    reset_schema("plv8_elog_it");
    Spi::run(
        "
        CREATE FUNCTION plv8_elog_it.chatty() RETURNS int4
        LANGUAGE plv8 AS $$
            plv8.elog(DEBUG1, 'debug', 1);
            plv8.elog(NOTICE, 'notice', { a: 1 });
            return 1;
        $$;
        CREATE FUNCTION plv8_elog_it.fail() RETURNS int4
        LANGUAGE plv8 AS $$ plv8.elog(ERROR, 'raised from script'); return 1; $$;
        CREATE FUNCTION plv8_elog_it.bad_level() RETURNS int4
        LANGUAGE plv8 AS $$ plv8.elog(12345, 'x'); return 1; $$;
        ",
    )
    .expect("elog setup SQL should succeed");

    let value = Spi::get_one::<i32>("SELECT plv8_elog_it.chatty()")
        .expect("chatty query should succeed")
        .expect("chatty should return a value");
    assert_eq!(value, 1);

    expect_error("SELECT plv8_elog_it.fail()", "raised from script");
    expect_error("SELECT plv8_elog_it.bad_level()", "invalid error level");

    drop_schema("plv8_elog_it");
}

#[pg_test]
fn test_execute_returns_rows_and_counts() {
    reset_schema("plv8_exec_it");
    Spi::run(
        "
        CREATE TABLE plv8_exec_it.items(id int4, name text);
        CREATE FUNCTION plv8_exec_it.work() RETURNS jsonb
        LANGUAGE plv8 AS $$
            var inserted = plv8.execute(
                'INSERT INTO plv8_exec_it.items VALUES ($1, $2), ($3, $4)',
                [1, 'one', 2, 'two']
            );
            var variadic = plv8.execute('SELECT $1::int4 + $2::int4 AS n', 20, 22);
            var rows = plv8.execute('SELECT id, name FROM plv8_exec_it.items ORDER BY id');
            return { inserted: inserted, n: variadic[0].n, rows: rows };
        $$;
        ",
    )
    .expect("execute setup SQL should succeed");

    let payload = Spi::get_one::<JsonB>("SELECT plv8_exec_it.work()")
        .expect("work query should succeed")
        .expect("work should return jsonb");

    assert_eq!(payload.0.get("inserted").and_then(Value::as_i64), Some(2));
    assert_eq!(payload.0.get("n").and_then(Value::as_i64), Some(42));
    assert_eq!(
        payload
            .0
            .get("rows")
            .and_then(Value::as_array)
            .and_then(|rows| rows.get(1))
            .and_then(|row| row.get("name"))
            .and_then(Value::as_str),
        Some("two")
    );

    drop_schema("plv8_exec_it");
}

#[pg_test]
fn test_execute_sql_error_is_catchable_in_script() {
    reset_schema("plv8_exec_err_it");
    Spi::run(
        "
        CREATE FUNCTION plv8_exec_err_it.safe() RETURNS text
        LANGUAGE plv8 AS $$
            try {
                plv8.execute('SELECT * FROM plv8_exec_err_it.missing_table');
                return 'no error';
            } catch (e) {
                return 'caught';
            }
        $$;
        ",
    )
    .expect("execute error setup SQL should succeed");

    let result = Spi::get_one::<String>("SELECT plv8_exec_err_it.safe()")
        .expect("safe query should succeed")
        .expect("safe should return a value");
    assert_eq!(result, "caught");

    drop_schema("plv8_exec_err_it");
}

#[pg_test]
fn test_prepared_plan_execute_and_cursor() {
    reset_schema("plv8_plan_it");
    Spi::run(
        "
        CREATE FUNCTION plv8_plan_it.planned() RETURNS jsonb
        LANGUAGE plv8 AS $$
            var plan = plv8.prepare('SELECT n FROM generate_series(1, $1) AS n', ['int4']);
            var rows = plan.execute([5]);
            var cursor = plan.cursor([5]);
            var first = cursor.fetch();
            cursor.move(1);
            var rest = cursor.fetch(10);
            cursor.close();
            plan.free();
            var freed = 'no';
            try { plan.execute([1]); } catch (e) { freed = String(e); }
            return { count: rows.length, first: first.n, rest: rest.length, freed: freed };
        $$;
        CREATE FUNCTION plv8_plan_it.wrong_arity() RETURNS int4
        LANGUAGE plv8 AS $$
            var plan = plv8.prepare('SELECT $1::int4 AS n', ['int4']);
            return plan.execute([1, 2])[0].n;
        $$;
        ",
    )
    .expect("plan setup SQL should succeed");

    let payload = Spi::get_one::<JsonB>("SELECT plv8_plan_it.planned()")
        .expect("planned query should succeed")
        .expect("planned should return jsonb");

    assert_eq!(payload.0.get("count").and_then(Value::as_i64), Some(5));
    assert_eq!(payload.0.get("first").and_then(Value::as_i64), Some(1));
    assert_eq!(payload.0.get("rest").and_then(Value::as_i64), Some(3));
    assert!(
        payload
            .0
            .get("freed")
            .and_then(Value::as_str)
            .is_some_and(|message| message.contains("plan has already been freed")),
        "executing a freed plan should throw"
    );

    expect_error("SELECT plv8_plan_it.wrong_arity()", "plan expected 1 argument(s), given is 2");

    drop_schema("plv8_plan_it");
}

#[pg_test]
fn test_subtransaction_rolls_back_on_throw() {
    reset_schema("plv8_subxact_it");
    Spi::run(
        "
        CREATE TABLE plv8_subxact_it.items(id int4);
        CREATE FUNCTION plv8_subxact_it.partial() RETURNS int4
        LANGUAGE plv8 AS $$
            plv8.execute('INSERT INTO plv8_subxact_it.items VALUES (1)');
            try {
                plv8.subtransaction(function () {
                    plv8.execute('INSERT INTO plv8_subxact_it.items VALUES (2)');
                    throw new Error('undo');
                });
            } catch (e) {}
            plv8.subtransaction(function () {
                plv8.execute('INSERT INTO plv8_subxact_it.items VALUES (3)');
            });
            return plv8.execute('SELECT sum(id)::int4 AS s FROM plv8_subxact_it.items')[0].s;
        $$;
        ",
    )
    .expect("subtransaction setup SQL should succeed");

    let sum = Spi::get_one::<i32>("SELECT plv8_subxact_it.partial()")
        .expect("partial query should succeed")
        .expect("partial should return a value");
    assert_eq!(sum, 4, "the failed subtransaction's insert must be rolled back");

    drop_schema("plv8_subxact_it");
}

#[pg_test]
fn test_find_function_calls_other_plv8_functions() {
    reset_schema("plv8_find_it");
    Spi::run(
        "
        CREATE FUNCTION plv8_find_it.square(x int4) RETURNS int4
        LANGUAGE plv8 AS $$ return x * x; $$;
        CREATE FUNCTION plv8_find_it.caller() RETURNS int4
        LANGUAGE plv8 AS $$
            var square = plv8.find_function('plv8_find_it.square(int4)');
            return square(7);
        $$;
        CREATE FUNCTION plv8_find_it.not_js() RETURNS int4
        LANGUAGE sql AS $$ SELECT 1 $$;
        CREATE FUNCTION plv8_find_it.finds_sql() RETURNS int4
        LANGUAGE plv8 AS $$ plv8.find_function('plv8_find_it.not_js'); return 0; $$;
        ",
    )
    .expect("find_function setup SQL should succeed");

    let squared = Spi::get_one::<i32>("SELECT plv8_find_it.caller()")
        .expect("caller query should succeed")
        .expect("caller should return a value");
    assert_eq!(squared, 49);

    expect_error("SELECT plv8_find_it.finds_sql()", "javascript function is not found");

    drop_schema("plv8_find_it");
}

#[pg_test]
fn test_find_function_of_missing_name_is_catchable() {
    reset_schema("plv8_find_missing_it");
    Spi::run(
        "
        CREATE FUNCTION plv8_find_missing_it.lookups() RETURNS text
        LANGUAGE plv8 AS $$
            var seen = [];
            ['plv8_find_missing_it.no_such_fn', 'plv8_find_missing_it.no_such_fn(int4)'].forEach(function (name) {
                try {
                    plv8.find_function(name);
                    seen.push('found');
                } catch (e) {
                    seen.push(e.message.indexOf('does not exist') >= 0 ? 'does not exist' : e.message);
                }
            });
            seen.push(plv8.execute('SELECT 41 + 1 AS n')[0].n);
            return seen.join('|');
        $$;
        ",
    )
    .expect("find_function setup SQL should succeed");

    let seen = Spi::get_one::<String>("SELECT plv8_find_missing_it.lookups()")
        .expect("lookups query should succeed")
        .expect("lookups should return a value");
    assert_eq!(seen, "does not exist|does not exist|42");

    Spi::run("SELECT 1").expect("the transaction should still be usable");

    drop_schema("plv8_find_missing_it");
}

#[pg_test]
fn test_quote_helpers() {
    reset_schema("plv8_quote_it");
    Spi::run(
        "
        CREATE FUNCTION plv8_quote_it.quotes() RETURNS jsonb
        LANGUAGE plv8 AS $$
            return {
                literal: plv8.quote_literal(\"it's\"),
                nullable: plv8.quote_nullable(null),
                ident: plv8.quote_ident('Mixed Case')
            };
        $$;
        ",
    )
    .expect("quote setup SQL should succeed");

    let payload = Spi::get_one::<JsonB>("SELECT plv8_quote_it.quotes()")
        .expect("quotes query should succeed")
        .expect("quotes should return jsonb");
    assert_eq!(payload.0.get("literal").and_then(Value::as_str), Some("'it''s'"));
    assert_eq!(payload.0.get("nullable").and_then(Value::as_str), Some("NULL"));
    assert_eq!(payload.0.get("ident").and_then(Value::as_str), Some("\"Mixed Case\""));

    drop_schema("plv8_quote_it");
}

#[pg_test]
fn test_window_function_sees_partition() {
    reset_schema("plv8_window_it");
    Spi::run(
        "
        CREATE FUNCTION plv8_window_it.position_and_size() RETURNS int4
        LANGUAGE plv8 WINDOW AS $$
            var win = plv8.get_window_object();
            var seen = win.get_partition_local() || { calls: 0 };
            seen.calls += 1;
            win.set_partition_local(seen);
            return win.get_current_position() * 100 + win.get_partition_row_count() * 10 + seen.calls;
        $$;
        CREATE FUNCTION plv8_window_it.lagged(v int4) RETURNS int4
        LANGUAGE plv8 WINDOW AS $$
            var win = plv8.get_window_object();
            var previous = win.get_func_arg_in_partition(0, -1, win.SEEK_CURRENT, false);
            return previous === undefined ? -1 : previous;
        $$;
        ",
    )
    .expect("window setup SQL should succeed");

    let codes = Spi::get_one::<String>(
        "
        SELECT string_agg(code::text, ',' ORDER BY g)
        FROM (
            SELECT g, plv8_window_it.position_and_size() OVER (ORDER BY g) AS code
            FROM generate_series(1, 3) AS g
        ) AS s
        ",
    )
    .expect("window query should succeed")
    .expect("string_agg should return a value");
    assert_eq!(codes, "31,132,233");

    let lagged = Spi::get_one::<String>(
        "
        SELECT string_agg(l::text, ',' ORDER BY g)
        FROM (
            SELECT g, plv8_window_it.lagged(g * 10) OVER (ORDER BY g) AS l
            FROM generate_series(1, 3) AS g
        ) AS s
        ",
    )
    .expect("lagged query should succeed")
    .expect("string_agg should return a value");
    assert_eq!(lagged, "-1,10,20");

    drop_schema("plv8_window_it");
}

#[pg_test]
fn test_get_window_object_outside_window_fails() {
    reset_schema("plv8_window_err_it");
    Spi::run(
        "
        CREATE FUNCTION plv8_window_err_it.plain() RETURNS int4
        LANGUAGE plv8 AS $$ plv8.get_window_object(); return 1; $$;
        ",
    )
    .expect("window error setup SQL should succeed");

    expect_error("SELECT plv8_window_err_it.plain()", "window");

    drop_schema("plv8_window_err_it");
}

#[pg_test]
fn test_inline_block_runs_script() {
    reset_schema("plv8_inline_it");
    Spi::run("CREATE TABLE plv8_inline_it.log(msg text);").expect("inline setup SQL should succeed");

    Spi::run(
        "
        DO $$
            plv8.execute('INSERT INTO plv8_inline_it.log VALUES ($1)', ['from inline']);
        $$ LANGUAGE plv8;
        ",
    )
    .expect("inline block should run");

    let message = Spi::get_one::<String>("SELECT msg FROM plv8_inline_it.log")
        .expect("log query should succeed")
        .expect("log should hold a row");
    assert_eq!(message, "from inline");

    expect_error("DO $$ throw new Error('inline failure'); $$ LANGUAGE plv8", "inline failure");

    drop_schema("plv8_inline_it");
}

#[pg_test]
fn test_validator_rejects_bad_definitions() {
    reset_schema("plv8_validator_it");

    expect_error(
        "CREATE FUNCTION plv8_validator_it.syntax() RETURNS int4 LANGUAGE plv8 AS $$ return ( ; $$",
        "SyntaxError",
    );
    expect_error(
        "CREATE FUNCTION plv8_validator_it.takes_internal(internal) RETURNS int4 LANGUAGE plv8 AS $$ return 1; $$",
        "PL/v8 functions cannot accept type internal",
    );
    expect_error(
        "CREATE FUNCTION plv8_validator_it.trigger_args(int4) RETURNS trigger LANGUAGE plv8 AS $$ return NEW; $$",
        "trigger function cannot have arguments",
    );

    drop_schema("plv8_validator_it");
}

#[pg_test]
fn test_metrics_count_compiles_and_calls() {
    reset_schema("plv8_metrics_it");
    Spi::run(
        "
        CREATE FUNCTION plv8_metrics_it.ok() RETURNS int4
        LANGUAGE plv8 AS $$ return 1; $$;
        CREATE FUNCTION plv8_metrics_it.fails() RETURNS int4
        LANGUAGE plv8 AS $$ throw new Error('metered'); $$;
        ",
    )
    .expect("metrics setup SQL should succeed");

    let before = Spi::get_one::<JsonB>("SELECT plv8.metrics()")
        .expect("metrics query should succeed")
        .expect("metrics should return jsonb");
    let calls_before = before
        .0
        .get("execute")
        .and_then(|execute| execute.get("calls"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let errors_before = before
        .0
        .get("execute")
        .and_then(|execute| execute.get("errors"))
        .and_then(Value::as_u64)
        .unwrap_or(0);

    Spi::run("SELECT plv8_metrics_it.ok()").expect("ok call should succeed");
    expect_error("SELECT plv8_metrics_it.fails()", "metered");

    let after = Spi::get_one::<JsonB>("SELECT plv8.metrics()")
        .expect("metrics query should succeed")
        .expect("metrics should return jsonb");
    let execute = after.0.get("execute").expect("metrics should include an execute section");

    assert!(execute.get("calls").and_then(Value::as_u64).unwrap_or(0) >= calls_before + 2);
    assert!(execute.get("errors").and_then(Value::as_u64).unwrap_or(0) >= errors_before + 1);
    assert!(execute.get("latency_ms").and_then(|latency| latency.get("total")).is_some());
    assert!(after.0.get("compile").and_then(|compile| compile.get("calls")).is_some());

    drop_schema("plv8_metrics_it");
}
