//! Bundled sample paper (PMC3398920, abridged)
//!
//! Intervals are token offsets within the sentence, inclusive on both ends.

use super::AnnotationSource;

/// Paper id
pub const PAPER_ID: &str = "PMC3398920";

/// Paper title
pub const TITLE: &str = "Rac-ing to the plasma membrane";

/// Section start lines
pub const SECTIONS: &str = "0,1,7";

/// Tokenized sentences, one per line
pub const SENTENCES: &[&str] = &[
    "Rac-ing to the plasma membrane",
    "The functional cycle of the Rac1 GTPase involves a large number of steps , including post-translational processing , cytosolic sequestration by RhoGDIs , translocation to specific subcellular localizations , activation by GDP and GTP exchange , inactivation by GTP hydrolysis , and re-formation of cytosolic Rac1 and RhoGDI inhibitory complexes .",
    "Here , we summarize the current knowledge about the regulation of those steps .",
    "In addition , we discuss a recently described , cytoskeletal dependent feed-back loop that favors the efficient translocation and activation of Rac subfamily proteins during cell signaling .",
    "This route is mediated by a heteromolecular protein complex composed of the cytoskeletal protein coronin1A , the Dbl family member ArhGEF7 , the serine and threonine kinase Pak1 , and the Rac1 and RhoGDI dimer .",
    "This route promotes the translocation of Rac1 and RhoGDI to F-actin-rich juxtamembrane areas , the Pak1 dependent release of Rac1 from the Rac1 and RhoGDI complex , and Rac1 activation .",
    "This pathway is important for optimal Rac1 activation during the signaling of the EGF receptor , integrins , and the antigenic T-cell receptor .",
    "Rac1 , one of the best characterized members of the Rho and Rac GTPase subfamily , regulates ubiquitous processes such as the formation of membrane ruffles and lamellipodia , cell adhesion , proliferation , intercellular attraction and repulsion , and transcriptomal dynamics .",
    "In addition , it modulates cell-type-specific processes such as axon migration and guidance , phagocytosis , or the formation of the immunological synapse .",
    "To trigger most of those functions , Rac1 has to fulfill two basic conditions .",
    "One of them is to be anchored at the plasma membrane to make it possible the subsequent activation of its primary effectors in the correct subcellular localization .",
    "The second condition is that it has to be bound to GTP , since this is the only conformational state compatible with the interaction of most downstream effectors .",
    "These requirements only change in few signaling scenarios , such as the cell cycle regulated transfer of Rac1 to the nucleus or the indistinctive binding of GDP-Rac and GTP-Rac1 to mTOR .",
    "Like the mythical Greek Odysseus , the travel of Rac1 from the cytosol to the plasma membrane is a stepwise mechanism subjected to multiple regulatory challenges ( ) .",
];

/// A context mention in the sample paper
#[derive(Debug, Clone, Copy)]
pub struct ToyContext {
    /// Mention text
    pub text: &'static str,
    /// Grounding id
    pub grounding: &'static str,
    /// Sentence index
    pub line: u32,
    /// Interval start
    pub start: u32,
    /// Interval end
    pub end: u32,
    /// Origin
    pub source: AnnotationSource,
}

/// An event mention in the sample paper
#[derive(Debug, Clone, Copy)]
pub struct ToyEvent {
    /// Sentence index
    pub line: u32,
    /// Interval start
    pub start: u32,
    /// Interval end
    pub end: u32,
    /// Origin
    pub source: AnnotationSource,
    /// Associated grounding ids
    pub groundings: &'static [&'static str],
}

const fn reach(text: &'static str, grounding: &'static str, line: u32, start: u32, end: u32) -> ToyContext {
    ToyContext {
        text,
        grounding,
        line,
        start,
        end,
        source: AnnotationSource::Reach,
    }
}

/// Contexts of the sample paper
pub const CONTEXTS: &[ToyContext] = &[
    reach("plasma membrane", "go:GO:0005886", 0, 3, 4),
    reach("membrane", "go:GO:0016020", 7, 24, 24),
    reach("immunological synapse", "go:GO:0001772", 8, 21, 22),
    reach("plasma membrane", "go:GO:0005886", 10, 9, 10),
    reach("nucleus", "go:GO:0005634", 12, 20, 20),
    reach("cytosol", "go:GO:0005829", 13, 12, 12),
    reach("plasma membrane", "go:GO:0005886", 13, 15, 16),
    ToyContext {
        text: "T-cell",
        grounding: "tissuelist:TS-1001",
        line: 6,
        start: 21,
        end: 21,
        source: AnnotationSource::Manual,
    },
];

/// Events of the sample paper
pub const EVENTS: &[ToyEvent] = &[
    ToyEvent {
        line: 1,
        start: 0,
        end: 50,
        source: AnnotationSource::Manual,
        groundings: &["tissuelist:TS-1001"],
    },
    ToyEvent {
        line: 4,
        start: 0,
        end: 35,
        source: AnnotationSource::Manual,
        groundings: &[],
    },
    ToyEvent {
        line: 5,
        start: 0,
        end: 30,
        source: AnnotationSource::Manual,
        groundings: &["tissuelist:TS-1001"],
    },
    ToyEvent {
        line: 1,
        start: 5,
        end: 7,
        source: AnnotationSource::Reach,
        groundings: &[],
    },
    ToyEvent {
        line: 5,
        start: 3,
        end: 6,
        source: AnnotationSource::Reach,
        groundings: &[],
    },
    ToyEvent {
        line: 9,
        start: 6,
        end: 10,
        source: AnnotationSource::Reach,
        groundings: &[],
    },
];
