#[allow(missing_docs)]
#[path = ""]
pub mod highpress {
    #[path = ""]
    pub mod common {
        #[allow(unused_qualifications)]
        #[allow(unused_results)]
        #[allow(clippy::must_use_candidate)]
        #[path = "highpress.common.v1.rs"]
        pub mod v1;
    }
    #[path = ""]
    pub mod counter {
        #[allow(unused_qualifications)]
        #[allow(unused_results)]
        #[allow(clippy::must_use_candidate)]
        #[path = "highpress.counter.v1.rs"]
        pub mod v1;
    }
    #[path = ""]
    pub mod analytics {
        #[allow(unused_qualifications)]
        #[allow(unused_results)]
        #[allow(clippy::must_use_candidate)]
        #[path = "highpress.analytics.v1.rs"]
        pub mod v1;
    }
}
