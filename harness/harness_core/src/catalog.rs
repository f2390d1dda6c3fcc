// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Test modules, fixtures and test cases.
//!
//! The catalog is immutable once built. Fixtures hold a weak reference to
//! their module and test cases a weak reference to their fixture, so the
//! module owns the whole tree.

use bitfield_struct::bitfield;
use std::fmt;
use std::sync::Arc;
use std::sync::Weak;

/// A setup, teardown, before, after or test case routine.
pub type Routine = Arc<dyn Fn() + Send + Sync>;

/// Per-fixture flags.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct FixtureFlags {
    /// Test code starts threads on its own (without
    /// [`crate::thread::spawn`]) and reports from them. Such threads are
    /// attached to a default filament for the duration of the fixture.
    pub uses_anonymous_threads: bool,
    #[bits(31)]
    _reserved: u32,
}

/// A single test case.
pub struct TestCase {
    name: String,
    routine: Routine,
    fixture: Weak<Fixture>,
}

impl TestCase {
    /// The test case name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The test routine.
    pub fn routine(&self) -> &Routine {
        &self.routine
    }

    /// The fixture this test case belongs to.
    pub fn fixture(&self) -> Option<Arc<Fixture>> {
        self.fixture.upgrade()
    }
}

impl fmt::Debug for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestCase").field("name", &self.name).finish()
    }
}

/// A named group of test cases sharing setup/teardown/before/after routines.
pub struct Fixture {
    name: String,
    setup: Option<Routine>,
    teardown: Option<Routine>,
    before: Option<Routine>,
    after: Option<Routine>,
    test_cases: Vec<TestCase>,
    flags: FixtureFlags,
    module: Weak<Module>,
}

impl Fixture {
    /// The fixture name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs once before the first test case.
    pub fn setup(&self) -> Option<&Routine> {
        self.setup.as_ref()
    }

    /// Runs once after the last test case.
    pub fn teardown(&self) -> Option<&Routine> {
        self.teardown.as_ref()
    }

    /// Runs before each test case.
    pub fn before(&self) -> Option<&Routine> {
        self.before.as_ref()
    }

    /// Runs after each test case.
    pub fn after(&self) -> Option<&Routine> {
        self.after.as_ref()
    }

    /// Test cases in declaration order.
    pub fn test_cases(&self) -> &[TestCase] {
        &self.test_cases
    }

    /// Looks up a test case by name.
    pub fn test_case(&self, name: &str) -> Option<&TestCase> {
        self.test_cases.iter().find(|test_case| test_case.name == name)
    }

    /// The fixture flags.
    pub fn flags(&self) -> FixtureFlags {
        self.flags
    }

    /// The module this fixture belongs to, if it was built as part of one.
    pub fn module(&self) -> Option<Arc<Module>> {
        self.module.upgrade()
    }
}

impl fmt::Debug for Fixture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fixture")
            .field("name", &self.name)
            .field("setup", &self.setup.is_some())
            .field("teardown", &self.teardown.is_some())
            .field("before", &self.before.is_some())
            .field("after", &self.after.is_some())
            .field("test_cases", &self.test_cases)
            .field("flags", &self.flags)
            .finish()
    }
}

/// A test module: an ordered list of fixtures.
#[derive(Debug)]
pub struct Module {
    name: String,
    fixtures: Vec<Arc<Fixture>>,
}

impl Module {
    /// The module name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fixtures in declaration order.
    pub fn fixtures(&self) -> &[Arc<Fixture>] {
        &self.fixtures
    }

    /// Looks up a fixture by name.
    pub fn fixture(&self, name: &str) -> Option<&Arc<Fixture>> {
        self.fixtures.iter().find(|fixture| fixture.name == name)
    }
}

/// Builds a [`Module`].
pub struct ModuleBuilder {
    name: String,
    fixtures: Vec<FixtureBuilder>,
}

impl ModuleBuilder {
    /// Starts a module named `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fixtures: Vec::new(),
        }
    }

    /// Appends a fixture.
    pub fn fixture(mut self, fixture: FixtureBuilder) -> Self {
        self.fixtures.push(fixture);
        self
    }

    /// Builds the module.
    pub fn build(self) -> Arc<Module> {
        let Self { name, fixtures } = self;
        Arc::new_cyclic(|module| Module {
            name,
            fixtures: fixtures
                .into_iter()
                .map(|fixture| fixture.build_in(module.clone()))
                .collect(),
        })
    }
}

/// Builds a [`Fixture`].
pub struct FixtureBuilder {
    name: String,
    setup: Option<Routine>,
    teardown: Option<Routine>,
    before: Option<Routine>,
    after: Option<Routine>,
    test_cases: Vec<(String, Routine)>,
    flags: FixtureFlags,
}

impl FixtureBuilder {
    /// Starts a fixture named `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            setup: None,
            teardown: None,
            before: None,
            after: None,
            test_cases: Vec::new(),
            flags: FixtureFlags::new(),
        }
    }

    /// Sets the setup routine.
    pub fn setup(mut self, routine: impl Fn() + Send + Sync + 'static) -> Self {
        self.setup = Some(Arc::new(routine));
        self
    }

    /// Sets the teardown routine.
    pub fn teardown(mut self, routine: impl Fn() + Send + Sync + 'static) -> Self {
        self.teardown = Some(Arc::new(routine));
        self
    }

    /// Sets the routine run before each test case.
    pub fn before(mut self, routine: impl Fn() + Send + Sync + 'static) -> Self {
        self.before = Some(Arc::new(routine));
        self
    }

    /// Sets the routine run after each test case.
    pub fn after(mut self, routine: impl Fn() + Send + Sync + 'static) -> Self {
        self.after = Some(Arc::new(routine));
        self
    }

    /// Appends a test case.
    pub fn test_case(
        mut self,
        name: impl Into<String>,
        routine: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        self.test_cases.push((name.into(), Arc::new(routine)));
        self
    }

    /// Sets the fixture flags.
    pub fn flags(mut self, flags: FixtureFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Builds a fixture that does not belong to any module.
    pub fn build(self) -> Arc<Fixture> {
        self.build_in(Weak::new())
    }

    fn build_in(self, module: Weak<Module>) -> Arc<Fixture> {
        let Self {
            name,
            setup,
            teardown,
            before,
            after,
            test_cases,
            flags,
        } = self;
        Arc::new_cyclic(|fixture| Fixture {
            name,
            setup,
            teardown,
            before,
            after,
            test_cases: test_cases
                .into_iter()
                .map(|(name, routine)| TestCase {
                    name,
                    routine,
                    fixture: fixture.clone(),
                })
                .collect(),
            flags,
            module,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn back_references_resolve() {
        let module = ModuleBuilder::new("module")
            .fixture(
                FixtureBuilder::new("first")
                    .setup(|| {})
                    .test_case("a", || {})
                    .test_case("b", || {}),
            )
            .fixture(FixtureBuilder::new("second"))
            .build();

        let first = module.fixture("first").unwrap();
        assert_eq!(first.module().unwrap().name(), "module");
        assert!(first.setup().is_some());
        assert!(first.teardown().is_none());

        let b = first.test_case("b").unwrap();
        assert_eq!(b.fixture().unwrap().name(), "first");
        assert_eq!(
            first
                .test_cases()
                .iter()
                .map(|t| t.name())
                .collect::<Vec<_>>(),
            ["a", "b"]
        );
        assert!(module.fixture("third").is_none());
    }

    #[test]
    fn standalone_fixture_has_no_module() {
        let fixture = FixtureBuilder::new("alone")
            .flags(FixtureFlags::new().with_uses_anonymous_threads(true))
            .build();
        assert!(fixture.module().is_none());
        assert!(fixture.flags().uses_anonymous_threads());
    }
}
