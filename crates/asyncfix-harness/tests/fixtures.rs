//! End-to-end fixture tests: synthesize, scan, load

use asyncfix_classfile::{access, ClassFile, OBJECT};
use asyncfix_harness::{
    CallSite, HarnessConfig, IsolatedLoader, LoadError, ModuleSynthesizer, TypeDef, TypeScope,
    Value,
};

const MARKER: &str = "com/ea/async/Async";

fn host() -> TypeScope {
    let scope = TypeScope::bootstrap();
    scope
        .register(TypeDef::interface("java/util/concurrent/Callable"))
        .unwrap();
    scope
        .register(TypeDef::class("java/util/concurrent/CompletableFuture", OBJECT))
        .unwrap();
    scope
}

fn loader() -> IsolatedLoader {
    IsolatedLoader::new(ModuleSynthesizer::from_config(&HarnessConfig::default()))
}

#[test]
fn test_marker_reference_is_detected() {
    let scope = host();
    let callable = scope.resolve("java/util/concurrent/Callable").unwrap();
    let scanner = HarnessConfig::default().scanner();
    let loader = loader();

    let plain = loader
        .synthesizer()
        .synthesize(&callable, &CallSite::new("plain", 10));
    assert!(!scanner.is_referenced_by(&plain));

    let marked = loader.synthesizer().synthesize_with(
        &callable,
        &CallSite::new("marked", 20),
        |builder| {
            let mut call = builder
                .method(access::PUBLIC, "call", "()Ljava/lang/Object;")
                .unwrap();
            call.aconst_null();
            call.invokestatic(MARKER, "await", "(Ljava/lang/Object;)Ljava/lang/Object;");
            call.areturn();
            call.set_max_stack(1);
            call.finish().unwrap();
        },
    );
    assert!(scanner.is_referenced_by(&marked));

    let instance = loader.load(&callable, &marked).unwrap();
    assert!(instance.is_instance_of("java/util/concurrent/Callable"));
}

#[test]
fn test_fixture_name_follows_call_site() {
    let scope = host();
    let future = scope
        .resolve("java/util/concurrent/CompletableFuture")
        .unwrap();
    let site = CallSite::caller("testNaming");
    let instance = loader().create(&future, &site).unwrap();

    assert_eq!(
        instance.type_name(),
        format!("asyncfix/Fixtures$ExperimentTestNaming{}", site.line())
    );
    assert!(instance.is_instance_of("java/util/concurrent/CompletableFuture"));
    assert!(scope.resolve(instance.type_name()).is_none());
}

#[test]
fn test_repeated_loads_do_not_collide() {
    let scope = host();
    let future = scope
        .resolve("java/util/concurrent/CompletableFuture")
        .unwrap();
    let loader = loader();
    let site = CallSite::new("repeat", 1);

    let instances: Vec<_> = (0..3).map(|_| loader.create(&future, &site).unwrap()).collect();
    for pair in instances.windows(2) {
        assert_eq!(pair[0].type_name(), pair[1].type_name());
        assert_ne!(pair[0].context().id(), pair[1].context().id());
    }
}

#[test]
fn test_fields_default_until_written() {
    let scope = host();
    let callable = scope.resolve("java/util/concurrent/Callable").unwrap();
    let instance = loader()
        .create_with(&callable, &CallSite::new("fields", 1), |builder| {
            builder.add_field(access::PRIVATE, "result", "Ljava/lang/Object;");
        })
        .unwrap();

    let class: &ClassFile = instance.loaded_type().class();
    assert_eq!(class.fields.len(), 1);
    assert!(matches!(instance.field("result"), None | Some(Value::Null)));
}

#[test]
fn test_duplicate_constructor_fails_at_load() {
    let scope = host();
    let callable = scope.resolve("java/util/concurrent/Callable").unwrap();
    let result = loader().create_with(&callable, &CallSite::new("dup", 1), |builder| {
        builder.add_abstract_method(access::PUBLIC, "<init>", "()V");
    });
    assert!(matches!(result, Err(LoadError::Verify(_))));
}
