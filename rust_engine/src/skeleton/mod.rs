//! SMPL 骨骼关节定义

/// SMPL 关节索引（拓扑排序，父关节索引总是小于子关节）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum SmplJoint {
    RootPelvis = 0,
    LHip = 1,
    RHip = 2,
    Spine1 = 3,
    LKnee = 4,
    RKnee = 5,
    Spine2 = 6,
    LAnkle = 7,
    RAnkle = 8,
    Spine3 = 9,
    LFoot = 10,
    RFoot = 11,
    Neck = 12,
    LCollar = 13,
    RCollar = 14,
    Head = 15,
    LShoulder = 16,
    RShoulder = 17,
    LElbow = 18,
    RElbow = 19,
    LWrist = 20,
    RWrist = 21,
    LHand = 22,
    RHand = 23,
}

impl SmplJoint {
    /// SMPL 关节总数
    pub const COUNT: usize = 24;

    pub const ALL: [SmplJoint; Self::COUNT] = [
        SmplJoint::RootPelvis,
        SmplJoint::LHip,
        SmplJoint::RHip,
        SmplJoint::Spine1,
        SmplJoint::LKnee,
        SmplJoint::RKnee,
        SmplJoint::Spine2,
        SmplJoint::LAnkle,
        SmplJoint::RAnkle,
        SmplJoint::Spine3,
        SmplJoint::LFoot,
        SmplJoint::RFoot,
        SmplJoint::Neck,
        SmplJoint::LCollar,
        SmplJoint::RCollar,
        SmplJoint::Head,
        SmplJoint::LShoulder,
        SmplJoint::RShoulder,
        SmplJoint::LElbow,
        SmplJoint::RElbow,
        SmplJoint::LWrist,
        SmplJoint::RWrist,
        SmplJoint::LHand,
        SmplJoint::RHand,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            SmplJoint::RootPelvis => "pelvis",
            SmplJoint::LHip => "l_hip",
            SmplJoint::RHip => "r_hip",
            SmplJoint::Spine1 => "spine1",
            SmplJoint::LKnee => "l_knee",
            SmplJoint::RKnee => "r_knee",
            SmplJoint::Spine2 => "spine2",
            SmplJoint::LAnkle => "l_ankle",
            SmplJoint::RAnkle => "r_ankle",
            SmplJoint::Spine3 => "spine3",
            SmplJoint::LFoot => "l_foot",
            SmplJoint::RFoot => "r_foot",
            SmplJoint::Neck => "neck",
            SmplJoint::LCollar => "l_collar",
            SmplJoint::RCollar => "r_collar",
            SmplJoint::Head => "head",
            SmplJoint::LShoulder => "l_shoulder",
            SmplJoint::RShoulder => "r_shoulder",
            SmplJoint::LElbow => "l_elbow",
            SmplJoint::RElbow => "r_elbow",
            SmplJoint::LWrist => "l_wrist",
            SmplJoint::RWrist => "r_wrist",
            SmplJoint::LHand => "l_hand",
            SmplJoint::RHand => "r_hand",
        }
    }
}
